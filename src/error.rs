//! Error types for the S0 smartmeter.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while setting up or addressing a metering channel.
///
/// None of these are fatal: a channel that fails to initialise simply stays
/// disabled while its siblings keep metering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("pin {pin} is outside the edge-capable range {min}..={max}")]
    PinOutOfRange { pin: u8, min: u8, max: u8 },

    #[error("{pulses} pulses/kWh is outside the supported range {min}..={max}")]
    CalibrationOutOfRange { pulses: u32, min: u32, max: u32 },

    #[error("pin {pin} is already used by channel {owner}")]
    PinInUse { pin: u8, owner: u8 },

    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    #[error("channel {0} is not initialised")]
    NotInitialized(u8),
}

/// Errors raised while loading, validating or persisting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },

    #[error("pin {pin} is already used by enabled channel {other}")]
    PinConflict { pin: u8, other: u8 },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
