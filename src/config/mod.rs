//! Station Configuration Module
//!
//! Strongly-typed TOML configuration for the detector, local storage, the
//! station identity and remote replication.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` on the command line
//! 2. `MUON_CONFIG` environment variable (path to TOML file)
//! 3. `muon_config.toml` in the current working directory
//! 4. Built-in defaults
//!
//! ## Usage
//!
//! The validated config is loaded once in `main()` and handed to each
//! component through `MonitorContext`; there is no global accessor.
//!
//! ```ignore
//! let loaded = MonitorConfig::load(cli.config.as_deref())?;
//! let ctx = MonitorContext::new(loaded.config, session);
//! ```

pub mod defaults;
mod monitor_config;
pub mod validation;

pub use monitor_config::*;
pub use validation::ValidationWarning;
