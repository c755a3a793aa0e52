//! ZVD-TQ - residual coding core of an HEVC-style video codec
//!
//! Forward/inverse transforms, quantization with RDOQ, rate-distortion cost
//! evaluation, transform-tree recursion and CABAC entropy coding, with every
//! encoder path mirrored by a parser that consumes exactly what it wrote.
//!
//! # Architecture
//!
//! - `codec::h265`: the pipeline itself (see its module docs)
//! - `error`: the shared [`Error`] type
//!
//! Container framing, prediction and mode decision are left to the caller.

pub mod codec;
pub mod error;

pub use error::{Error, Result};

/// ZVD-TQ version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Configuration for the library
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Enable verbose logging
    pub verbose: bool,
    /// Enable debug output
    pub debug: bool,
    /// Explicit `tracing` filter, overrides `verbose`/`debug`
    pub log_filter: Option<String>,
}

/// Initialize logging for the given configuration
///
/// Safe to call more than once; only the first subscriber is installed.
pub fn init(config: Config) -> Result<()> {
    let filter = match (&config.log_filter, config.debug, config.verbose) {
        (Some(filter), _, _) => filter.clone(),
        (None, true, _) => "debug".to_string(),
        (None, false, true) => "info".to_string(),
        (None, false, false) => return Ok(()),
    };
    let filter = tracing_subscriber::EnvFilter::try_new(&filter)
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", filter, e)))?;
    // A subscriber installed earlier (tests, host application) wins
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION_MAJOR, 0);
        assert_eq!(VERSION_MINOR, 1);
        assert_eq!(VERSION_PATCH, 0);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.verbose);
        assert!(!config.debug);
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn test_init() {
        assert!(init(Config::default()).is_ok());
        let debug = Config {
            debug: true,
            ..Default::default()
        };
        assert!(init(debug.clone()).is_ok());
        assert!(init(debug).is_ok());
    }

    #[test]
    fn test_invalid_filter() {
        let config = Config {
            log_filter: Some("zvd_tq=notalevel".to_string()),
            ..Default::default()
        };
        assert!(init(config).is_err());
    }
}
