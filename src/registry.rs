use crate::config::MeterConfig;
use crate::error::ChannelError;
use crate::estimator::{ChannelEstimator, Snapshot};
use crate::pulse_input::{EdgeMask, PortIo};
use tracing::{error, info};

/// Number of channel slots. One per pin of the shared interrupt group.
pub const MAX_CHANNELS: usize = 8;

/// Fixed arena of all metering channels, indexed by channel id.
///
/// Owned by the application root and shared by reference with the edge
/// sampler and the poll loop; no slot is ever added or removed after
/// start-up.
pub struct ChannelRegistry {
    channels: [ChannelEstimator; MAX_CHANNELS],
    edge_mask: EdgeMask,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|index| ChannelEstimator::new(index as u8)),
            edge_mask: EdgeMask::new(),
        }
    }

    /// Builds a registry from persisted settings, initialising and enabling
    /// every channel marked as enabled. Channels that fail validation are
    /// logged and left disabled.
    pub fn from_config(config: &MeterConfig, port: &dyn PortIo) -> Self {
        let mut registry = Self::new();

        for (index, settings) in config.channels.iter().enumerate().take(MAX_CHANNELS) {
            if !settings.enabled {
                continue;
            }
            let id = index as u8;
            info!(
                "Init. and enable interface {} {} at pin {}",
                id, settings.name, settings.pin
            );

            let result = registry
                .init_channel(id, &settings.name, settings.pin, settings.pulses_per_kwh, port)
                .and_then(|()| registry.enable(id));
            if let Err(e) = result {
                error!("Failed to initialize S0 interface {}: {}", id, e);
            }
        }

        registry
    }

    /// Initialises slot `id`. Refuses a pin that another initialised and
    /// enabled channel is already wired to.
    pub fn init_channel(
        &mut self,
        id: u8,
        name: &str,
        pin: u8,
        pulses_per_kwh: u32,
        port: &dyn PortIo,
    ) -> Result<(), ChannelError> {
        let index = Self::index(id)?;

        if let Some(owner) = self
            .channels
            .iter()
            .find(|other| other.id() != id && other.is_enabled() && other.pin() == Some(pin))
        {
            return Err(ChannelError::PinInUse {
                pin,
                owner: owner.id(),
            });
        }

        let edge_mask = &self.edge_mask;
        let channel = &mut self.channels[index];
        channel.disable(edge_mask);
        channel.init(id, name, pin, pulses_per_kwh, port)
    }

    pub fn enable(&self, id: u8) -> Result<(), ChannelError> {
        self.channels[Self::index(id)?].enable(&self.edge_mask)
    }

    pub fn disable(&self, id: u8) -> Result<(), ChannelError> {
        self.channels[Self::index(id)?].disable(&self.edge_mask);
        Ok(())
    }

    pub fn channel(&self, id: u8) -> Option<&ChannelEstimator> {
        self.channels.get(usize::from(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelEstimator> {
        self.channels.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ChannelEstimator> {
        self.channels.iter().filter(|channel| channel.is_enabled())
    }

    /// Runs one decay step for every enabled channel. Call once per poll
    /// loop iteration.
    pub fn decay_all(&self, now_ms: u32) {
        for channel in self.enabled() {
            channel.decay(now_ms);
        }
    }

    /// Takes a snapshot of channel `id`.
    pub fn snapshot(&self, id: u8) -> Result<Snapshot, ChannelError> {
        Ok(self.channels[Self::index(id)?].snapshot())
    }

    pub fn edge_mask(&self) -> &EdgeMask {
        &self.edge_mask
    }

    fn index(id: u8) -> Result<usize, ChannelError> {
        let index = usize::from(id);
        if index < MAX_CHANNELS {
            Ok(index)
        } else {
            Err(ChannelError::UnknownChannel(id))
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSettings;
    use crate::simulator::SimulatedPort;

    #[test]
    fn test_new_registry_is_inert() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.iter().count(), MAX_CHANNELS);
        assert_eq!(registry.enabled().count(), 0);
        assert_eq!(registry.edge_mask().bits(), 0);
        for (index, channel) in registry.iter().enumerate() {
            assert_eq!(usize::from(channel.id()), index);
            assert!(!channel.is_initialized());
        }
    }

    #[test]
    fn test_unknown_channel() {
        let port = SimulatedPort::new();
        let mut registry = ChannelRegistry::new();
        assert_eq!(
            registry.init_channel(8, "x", 24, 1000, &port),
            Err(ChannelError::UnknownChannel(8))
        );
        assert_eq!(registry.enable(200), Err(ChannelError::UnknownChannel(200)));
        assert!(registry.channel(8).is_none());
        assert_eq!(registry.snapshot(9), Err(ChannelError::UnknownChannel(9)));
    }

    #[test]
    fn test_pin_conflict_rejected() {
        let port = SimulatedPort::new();
        let mut registry = ChannelRegistry::new();
        registry.init_channel(0, "a", 26, 1000, &port).unwrap();
        registry.enable(0).unwrap();

        assert_eq!(
            registry.init_channel(1, "b", 26, 1000, &port),
            Err(ChannelError::PinInUse { pin: 26, owner: 0 })
        );

        // Free again once the owner is disabled
        registry.disable(0).unwrap();
        registry.init_channel(1, "b", 26, 1000, &port).unwrap();
    }

    #[test]
    fn test_reinit_moves_mask_bit() {
        let port = SimulatedPort::new();
        let mut registry = ChannelRegistry::new();
        registry.init_channel(3, "a", 24, 1000, &port).unwrap();
        registry.enable(3).unwrap();
        assert_eq!(registry.edge_mask().bits(), 0b0000_0001);

        registry.init_channel(3, "a", 30, 500, &port).unwrap();
        assert_eq!(registry.edge_mask().bits(), 0);
        registry.enable(3).unwrap();
        assert_eq!(registry.edge_mask().bits(), 0b0100_0000);
        assert_eq!(registry.channel(3).unwrap().pulses_per_kwh(), 500);
    }

    #[test]
    fn test_from_config_skips_invalid_channels() {
        let port = SimulatedPort::new();
        let mut config = MeterConfig::default();
        config.channels[0] = ChannelSettings {
            enabled: true,
            name: "House".to_string(),
            pin: 24,
            pulses_per_kwh: 1000,
            simulated_watts: None,
        };
        config.channels[1] = ChannelSettings {
            enabled: true,
            name: "Bad pin".to_string(),
            pin: 3,
            pulses_per_kwh: 1000,
            simulated_watts: None,
        };
        config.channels[2] = ChannelSettings {
            enabled: true,
            name: "Bad calibration".to_string(),
            pin: 26,
            pulses_per_kwh: 0,
            simulated_watts: None,
        };
        config.channels[5] = ChannelSettings {
            enabled: true,
            name: "Garage".to_string(),
            pin: 29,
            pulses_per_kwh: 2000,
            simulated_watts: None,
        };

        let registry = ChannelRegistry::from_config(&config, &port);
        let enabled: Vec<u8> = registry.enabled().map(|channel| channel.id()).collect();
        assert_eq!(enabled, vec![0, 5]);
        assert_eq!(registry.edge_mask().bits(), 0b0010_0001);
        assert_eq!(registry.channel(5).unwrap().name(), "Garage");
    }

    #[test]
    fn test_decay_all_only_touches_enabled() {
        let port = SimulatedPort::new();
        let mut registry = ChannelRegistry::new();
        registry.init_channel(0, "a", 24, 1000, &port).unwrap();
        registry.init_channel(1, "b", 25, 1000, &port).unwrap();
        registry.enable(0).unwrap();
        registry.enable(1).unwrap();

        for id in [0, 1] {
            let channel = registry.channel(id).unwrap();
            channel.on_pulse(0);
            channel.on_pulse(3600);
        }
        registry.disable(1).unwrap();
        registry.decay_all(3600 + 7200);

        assert_eq!(registry.channel(0).unwrap().runtime_state().power_watts, 500);
        assert_eq!(registry.channel(1).unwrap().runtime_state().power_watts, 1000);
    }
}
