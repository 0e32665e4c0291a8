use crate::clock::Clock;
use crate::dispatcher::{ChannelDispatcher, ChannelSet};
use crate::pulse_input::{PortIo, PORT_IDLE_LEVELS};
use crate::registry::ChannelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Stand-in for the shared pin-change interrupt on a hosted target.
///
/// Samples the port at a fixed rate and raises a dispatch whenever a pin
/// with its edge-mask bit set changed level. Pulses shorter than the
/// sample interval can be missed; S0 pulses last at least 30 ms.
pub struct EdgeSampler {
    port: Arc<dyn PortIo>,
    registry: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    dispatcher: ChannelDispatcher,
    sample_interval: Duration,
    last_levels: u8,
}

impl EdgeSampler {
    pub fn new(
        port: Arc<dyn PortIo>,
        registry: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        sample_interval: Duration,
    ) -> Self {
        Self {
            port,
            registry,
            clock,
            dispatcher: ChannelDispatcher::new(),
            sample_interval,
            last_levels: PORT_IDLE_LEVELS,
        }
    }

    /// Spawns the sampler in its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sampler = self;
            sampler.run().await;
        })
    }

    async fn run(&mut self) {
        debug!("Starting edge sampler every {:?}", self.sample_interval);

        let mut sample_interval = interval(self.sample_interval);
        sample_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            sample_interval.tick().await;
            let pulsed = self.poll_once();
            if !pulsed.is_empty() {
                debug!("Pulse on channels {:?}", pulsed.iter().collect::<Vec<_>>());
            }
        }
    }

    /// Reads the port once and dispatches if a masked pin changed.
    pub fn poll_once(&mut self) -> ChannelSet {
        let levels = self.port.read_levels();
        let changed = (levels ^ self.last_levels) & self.registry.edge_mask().bits();
        self.last_levels = levels;

        if changed == 0 {
            return ChannelSet::empty();
        }
        self.dispatcher
            .dispatch(levels, &self.registry, self.clock.now_ms())
    }
}
