pub mod config;
pub mod routes;

pub use config::{Config, ConfigError};
