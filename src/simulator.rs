use crate::pulse_input::{PortIo, PIN_RANGE_MIN, PORT_IDLE_LEVELS};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::info;

/// Minimum low time of an S0 pulse.
pub const S0_PULSE_WIDTH: Duration = Duration::from_millis(30);

/// In-memory stand-in for the S0 input port.
///
/// Every pin idles high (pull-up); an S0 output pulls its pin low for the
/// duration of a pulse.
#[derive(Debug)]
pub struct SimulatedPort {
    levels: AtomicU8,
    configured_inputs: AtomicU8,
}

impl SimulatedPort {
    pub const fn new() -> Self {
        Self {
            levels: AtomicU8::new(PORT_IDLE_LEVELS),
            configured_inputs: AtomicU8::new(0),
        }
    }

    /// Pulls port bit `bit` low.
    pub fn drive_low(&self, bit: u8) {
        self.levels.fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    /// Releases port bit `bit` back to its pull-up level.
    pub fn release(&self, bit: u8) {
        self.levels.fetch_or(1 << bit, Ordering::AcqRel);
    }

    pub fn set_levels(&self, levels: u8) {
        self.levels.store(levels, Ordering::Release);
    }

    /// Bits of the pins configured as inputs with pull-up.
    pub fn configured_inputs(&self) -> u8 {
        self.configured_inputs.load(Ordering::Acquire)
    }
}

impl Default for SimulatedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIo for SimulatedPort {
    fn configure_input_pullup(&self, pin: u8) {
        if let Some(bit) = pin.checked_sub(PIN_RANGE_MIN).filter(|bit| *bit < 8) {
            self.configured_inputs.fetch_or(1 << bit, Ordering::AcqRel);
            self.release(bit);
        }
    }

    fn read_levels(&self) -> u8 {
        self.levels.load(Ordering::Acquire)
    }
}

/// Time between two pulses of a meter calibrated to `pulses_per_kwh`
/// under a constant load of `watts`. `None` for no load.
pub fn pulse_period(watts: u32, pulses_per_kwh: u32) -> Option<Duration> {
    if watts == 0 || pulses_per_kwh == 0 {
        return None;
    }
    // 1 kWh = 3.6e9 W·ms
    let period_ms = 3_600_000_000u64 / (u64::from(watts) * u64::from(pulses_per_kwh));
    Some(Duration::from_millis(period_ms.max(1)))
}

/// Emits S0 pulses on one pin of a [`SimulatedPort`] for a constant load.
#[derive(Debug)]
pub struct SimulatedMeter {
    port: Arc<SimulatedPort>,
    bit: u8,
    period: Duration,
    pulse_width: Duration,
}

impl SimulatedMeter {
    pub fn new(port: Arc<SimulatedPort>, pin: u8, watts: u32, pulses_per_kwh: u32) -> Option<Self> {
        let bit = pin.checked_sub(PIN_RANGE_MIN).filter(|bit| *bit < 8)?;
        let period = pulse_period(watts, pulses_per_kwh)?;
        // Keep some high time for very fast pulse trains
        let pulse_width = S0_PULSE_WIDTH.min(period / 2);

        Some(Self {
            port,
            bit,
            period,
            pulse_width,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            "Simulating S0 meter on port bit {} with a pulse every {:?}",
            self.bit, self.period
        );
        let idle = self.period.saturating_sub(self.pulse_width);
        loop {
            sleep(idle).await;
            self.port.drive_low(self.bit);
            sleep(self.pulse_width).await;
            self.port.release(self.bit);
        }
    }
}
