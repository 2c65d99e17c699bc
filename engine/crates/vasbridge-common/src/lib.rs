//! vasbridge Common - Shared utilities: logging, configuration
//!
//! This crate provides common functionality used across all vasbridge crates.

pub mod config;
pub mod logging;

pub use config::{Config, ConfigBuilder};
pub use logging::init_logging;

/// Name of the local host, used as the default self-publish device name
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        use std::ffi::{c_char, CStr};
        let mut buf = [0 as c_char; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
        if rc != 0 {
            return String::from("localhost");
        }
        buf[buf.len() - 1] = 0;
        unsafe { CStr::from_ptr(buf.as_ptr()).to_string_lossy().to_string() }
    }
    #[cfg(windows)]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".into())
    }
    #[cfg(not(any(unix, windows)))]
    {
        String::from("localhost")
    }
}
