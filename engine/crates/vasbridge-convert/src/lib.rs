//! vasbridge Convert - scanner results to IF-MAP publish elements
//!
//! A [`Converter`] turns the vulnerabilities that appeared in a report into
//! update elements and those that disappeared into delete elements. Every
//! converter keeps the two sides symmetric: applying the deletes for a set
//! of vulnerabilities removes everything the updates for that set created.
//!
//! Converters are selected by name through the [`ConverterRegistry`].

pub mod converter;
pub mod event;
pub mod feature;
pub mod filtered;
pub mod registry;

pub use converter::{Converter, ConverterContext, ConverterSettings, DeviceResolver};
pub use event::FullConverter;
pub use feature::FeatureConverter;
pub use filtered::FilteredConverter;
pub use registry::{ConverterFactory, ConverterRegistry};
