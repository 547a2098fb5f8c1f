//! Echo server composition over the swivel runtime: configuration file
//! parsing, logging initialization, and signal handling.

pub mod config;
pub mod logging;
pub mod signal;

pub use config::Config;
