//! Per-risk-level inclusion policy and its string form
//!
//! The string form is either empty (nothing passes), the literal `ALL`
//! (everything passes) or a whitespace separated list of risk factor names,
//! e.g. `"High Critical"`.

use crate::error::{Error, Result};
use crate::severity::RiskFactor;
use std::str::FromStr;

/// Total map from [`RiskFactor`] to "included"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RiskFilter {
    levels: [bool; 6],
}

impl RiskFilter {
    /// Nothing passes
    pub fn none() -> Self {
        Self { levels: [false; 6] }
    }

    /// Everything passes
    pub fn all() -> Self {
        Self { levels: [true; 6] }
    }

    /// Include a level
    pub fn with(mut self, level: RiskFactor) -> Self {
        self.levels[level.index()] = true;
        self
    }

    pub fn set(&mut self, level: RiskFactor, included: bool) {
        self.levels[level.index()] = included;
    }

    /// Does this filter let `level` through
    pub fn allows(&self, level: RiskFactor) -> bool {
        self.levels[level.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.levels.iter().any(|included| *included)
    }

    /// Included levels, ascending
    pub fn included(&self) -> impl Iterator<Item = RiskFactor> + '_ {
        RiskFactor::ALL
            .iter()
            .copied()
            .filter(move |level| self.allows(*level))
    }
}

impl FromStr for RiskFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FilterParser::parse(s)
    }
}

impl std::fmt::Display for RiskFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == RiskFilter::all() {
            return write!(f, "ALL");
        }
        let names: Vec<&str> = self.included().map(|level| level.as_str()).collect();
        write!(f, "{}", names.join(" "))
    }
}

/// Parser for the string form of a [`RiskFilter`]
pub struct FilterParser;

impl FilterParser {
    /// Keyword that includes every level
    pub const ALL: &'static str = "ALL";

    /// Parse a filter string. Tokens are case sensitive and must name a
    /// [`RiskFactor`]; the first unrecognized token fails the whole parse.
    pub fn parse(input: &str) -> Result<RiskFilter> {
        let input = input.trim();

        if input.is_empty() {
            return Ok(RiskFilter::none());
        }
        if input == Self::ALL {
            return Ok(RiskFilter::all());
        }

        input
            .split_whitespace()
            .try_fold(RiskFilter::none(), |filter, token| {
                token
                    .parse::<RiskFactor>()
                    .map(|level| filter.with(level))
                    .map_err(|_| Error::FilterParse {
                        token: token.to_string(),
                    })
            })
    }
}
