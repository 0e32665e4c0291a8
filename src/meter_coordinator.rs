use crate::clock::Clock;
use crate::config::{ConfigStore, RuntimeSettings};
use crate::edge_sampler::EdgeSampler;
use crate::http_api::AppState;
use crate::pulse_input::PortIo;
use crate::registry::ChannelRegistry;
use crate::simulator::{SimulatedMeter, SimulatedPort};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Application root.
///
/// Builds the channel registry from the stored settings and runs the two
/// metering contexts as separate tasks: the edge sampler and the poll loop
/// that steps every channel's power estimate down between pulses.
pub struct MeterCoordinator {
    registry: Arc<ChannelRegistry>,
    store: Arc<ConfigStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeterCoordinator {
    /// Applies the configuration and starts the sampler and the poll loop
    pub fn start(
        settings: &RuntimeSettings,
        store: Arc<ConfigStore>,
        port: Arc<dyn PortIo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!("Initializing meter coordinator");

        let registry = Arc::new(ChannelRegistry::from_config(&store.config(), port.as_ref()));
        let enabled = registry.enabled().count();
        if enabled == 0 {
            warn!("No S0 interface enabled, configure one and restart");
        }

        let sampler = EdgeSampler::new(port, registry.clone(), clock.clone(), settings.sample_interval);
        let tasks = vec![
            sampler.spawn(),
            Self::spawn_poll_loop(registry.clone(), clock, settings.poll_interval),
        ];

        info!("Metering started with {} enabled interface(s)", enabled);

        Self {
            registry,
            store,
            tasks,
        }
    }

    /// Starts a simulated meter on every enabled channel that has a
    /// `simulated_watts` load configured. Returns how many were started.
    pub fn start_simulation(&mut self, port: Arc<SimulatedPort>) -> usize {
        let config = self.store.config();
        let mut started = 0;

        for channel in self.registry.enabled() {
            let Some(watts) = config
                .channel(channel.id())
                .and_then(|settings| settings.simulated_watts)
            else {
                continue;
            };
            let Some(pin) = channel.pin() else {
                continue;
            };
            match SimulatedMeter::new(port.clone(), pin, watts, channel.pulses_per_kwh()) {
                Some(meter) => {
                    info!("Simulating {} W on interface {}", watts, channel.id());
                    self.tasks.push(meter.spawn());
                    started += 1;
                }
                None => warn!("Cannot simulate {} W on interface {}", watts, channel.id()),
            }
        }

        started
    }

    fn spawn_poll_loop(
        registry: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut poll_interval = interval(poll_interval);
            poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                poll_interval.tick().await;
                registry.decay_all(clock.now_ms());
            }
        })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Shared state for the HTTP handlers
    pub fn app_state(&self) -> AppState {
        AppState::new(self.registry.clone(), self.store.clone())
    }

    /// Stops every task started by this coordinator.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MeterCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
