//! Configuration Module
//!
//! Environment-driven configuration for the streaming client binary.

mod settings;

pub use settings::{
    ConfigError, Credentials, EndpointSettings, StreamClientConfig, StreamSettings,
};
