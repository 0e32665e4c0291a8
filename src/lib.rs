//! S0 Smartmeter Library
//!
//! Meters up to eight S0 pulse outputs of utility meters sharing one
//! pin-change interrupt group, estimates the current power of each channel
//! from the pulse interval and accumulates energy between reads.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod edge_sampler;
pub mod error;
pub mod estimator;
pub mod http_api;
pub mod meter_coordinator;
pub mod pulse_input;
pub mod registry;
pub mod simulator;

// Re-export commonly used types for easier access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigStore, MeterConfig, RuntimeSettings};
pub use dispatcher::{ChannelDispatcher, ChannelSet};
pub use edge_sampler::EdgeSampler;
pub use error::{ChannelError, ConfigError};
pub use estimator::{ChannelEstimator, Phase, Snapshot};
pub use meter_coordinator::MeterCoordinator;
pub use pulse_input::{EdgeMask, PortIo, PulseInput};
pub use registry::ChannelRegistry;
pub use simulator::{SimulatedMeter, SimulatedPort};
