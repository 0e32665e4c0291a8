use crate::error::ChannelError;
use crate::pulse_input::{EdgeMask, PortIo, PulseInput};
use critical_section::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lowest accepted calibration, in pulses per kWh.
pub const PULSES_PER_KWH_RANGE_MIN: u32 = 1;
/// Highest accepted calibration, in pulses per kWh.
pub const PULSES_PER_KWH_RANGE_MAX: u32 = 6000;

/// Maximum length of a channel name in bytes.
pub const NAME_CAPACITY: usize = 32;

/// Largest `now - last_pulse` difference taken as elapsed time. Anything
/// larger is a reading taken before the last pulse.
const MAX_ELAPSED_MS: u32 = u32::MAX / 2;

/// Energy of one kWh in Ws.
const WS_PER_KWH: u32 = 60 * 60 * 1000;

pub type ChannelName = heapless::String<NAME_CAPACITY>;

/// Where a channel is in its pulse/decay cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No pulse seen since init.
    #[default]
    AwaitingFirstPulse,
    /// Last pulse time is known but there is no load estimate.
    Idle,
    /// Estimate derived from the last inter-pulse interval.
    Pulsing,
    /// Estimate stepped down at least once since the last pulse.
    Decaying,
}

/// Per-channel state shared between the pulse path and the poll loop.
///
/// All fields change together inside one critical section, so readers
/// always see a consistent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeState {
    pub phase: Phase,
    pub pulse_count: u32,
    pub last_pulse_ms: u32,
    pub last_interval_ms: u32,
    pub power_watts: u32,
    pub decay_interval_ms: u32,
    pub decay_deadline_ms: u32,
}

impl RuntimeState {
    pub const fn new() -> Self {
        Self {
            phase: Phase::AwaitingFirstPulse,
            pulse_count: 0,
            last_pulse_ms: 0,
            last_interval_ms: 0,
            power_watts: 0,
            decay_interval_ms: 0,
            decay_deadline_ms: 0,
        }
    }

    /// Accounts one pulse seen at `now_ms`.
    pub fn record_pulse(&mut self, now_ms: u32, energy_per_pulse: u32) {
        self.pulse_count = self.pulse_count.saturating_add(1);

        if self.phase == Phase::AwaitingFirstPulse {
            self.last_pulse_ms = now_ms;
            self.phase = Phase::Idle;
            return;
        }

        let interval = now_ms.wrapping_sub(self.last_pulse_ms);
        if interval == 0 {
            // Bounced or duplicated edge, keep the previous estimate.
            return;
        }

        self.last_pulse_ms = now_ms;
        self.last_interval_ms = interval;
        self.power_watts = power_for_interval(energy_per_pulse, interval);
        self.decay_interval_ms = interval.saturating_mul(2);
        self.decay_deadline_ms = now_ms.wrapping_add(self.decay_interval_ms);
        self.phase = Phase::Pulsing;
    }

    /// Steps the estimate down for every decay deadline reached by `now_ms`.
    /// Returns the number of steps taken. A `now_ms` older than the last
    /// pulse is ignored.
    pub fn apply_decay(&mut self, now_ms: u32, energy_per_pulse: u32) -> u32 {
        if !matches!(self.phase, Phase::Pulsing | Phase::Decaying) {
            return 0;
        }

        let elapsed = now_ms.wrapping_sub(self.last_pulse_ms);
        if elapsed > MAX_ELAPSED_MS {
            // A pulse landed between reading the clock and taking the lock.
            return 0;
        }
        let mut steps = 0;

        while self.power_watts > 0 && elapsed >= self.decay_interval_ms {
            steps += 1;
            let delta = power_for_interval(energy_per_pulse, self.decay_interval_ms);

            if delta == 0 || delta >= self.power_watts || self.decay_interval_ms == u32::MAX {
                self.power_watts = 0;
                self.phase = Phase::Idle;
                break;
            }

            self.power_watts -= delta;
            self.decay_interval_ms = self.decay_interval_ms.saturating_mul(2);
            self.decay_deadline_ms = self.last_pulse_ms.wrapping_add(self.decay_interval_ms);
            self.phase = Phase::Decaying;
        }

        steps
    }
}

/// Power in W for one pulse worth `energy_per_pulse` Ws spread over
/// `interval_ms`.
fn power_for_interval(energy_per_pulse: u32, interval_ms: u32) -> u32 {
    let watts = u64::from(energy_per_pulse) * 1000 / u64::from(interval_ms.max(1));
    u32::try_from(watts).unwrap_or(u32::MAX)
}

/// Consistent reading handed to a consumer by [`ChannelEstimator::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub power_watts: u32,
    /// Energy of the pulses counted since the previous snapshot, in Ws.
    pub energy_ws: u64,
    pub pulse_count: u32,
}

/// One S0 metering channel: static configuration plus the pulse counter and
/// power estimator behind it.
///
/// [`on_pulse`](Self::on_pulse) runs in the edge (interrupt) context,
/// [`decay`](Self::decay) and [`snapshot`](Self::snapshot) in the poll
/// context. Both sides touch [`RuntimeState`] only inside
/// `critical_section::with`.
pub struct ChannelEstimator {
    id: u8,
    name: ChannelName,
    input: Option<PulseInput>,
    pulses_per_kwh: u32,
    energy_per_pulse: u32,
    enabled: AtomicBool,
    state: Mutex<Cell<RuntimeState>>,
}

impl ChannelEstimator {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            name: ChannelName::new(),
            input: None,
            pulses_per_kwh: 0,
            energy_per_pulse: 0,
            enabled: AtomicBool::new(false),
            state: Mutex::new(Cell::new(RuntimeState::new())),
        }
    }

    /// Validates and applies the static configuration of the channel.
    ///
    /// On error the channel keeps its previous configuration. A successful
    /// init starts from a fresh runtime state; the channel stays disabled
    /// until [`enable`](Self::enable) is called.
    pub fn init(
        &mut self,
        id: u8,
        name: &str,
        pin: u8,
        pulses_per_kwh: u32,
        port: &dyn PortIo,
    ) -> Result<(), ChannelError> {
        if !(PULSES_PER_KWH_RANGE_MIN..=PULSES_PER_KWH_RANGE_MAX).contains(&pulses_per_kwh) {
            return Err(ChannelError::CalibrationOutOfRange {
                pulses: pulses_per_kwh,
                min: PULSES_PER_KWH_RANGE_MIN,
                max: PULSES_PER_KWH_RANGE_MAX,
            });
        }
        let input = PulseInput::init(pin, port)?;

        self.id = id;
        self.name = bounded_name(name);
        self.input = Some(input);
        self.pulses_per_kwh = pulses_per_kwh;
        self.energy_per_pulse = WS_PER_KWH / pulses_per_kwh;
        *self.enabled.get_mut() = false;
        self.state.get_mut().set(RuntimeState::new());
        Ok(())
    }

    pub fn enable(&self, mask: &EdgeMask) -> Result<(), ChannelError> {
        let input = self.input.ok_or(ChannelError::NotInitialized(self.id))?;
        input.enable(mask);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops counting. The runtime state is kept as it is.
    pub fn disable(&self, mask: &EdgeMask) {
        if let Some(input) = self.input {
            input.disable(mask);
        }
        self.enabled.store(false, Ordering::Release);
    }

    /// Handles one falling edge. Edge context only.
    pub fn on_pulse(&self, now_ms: u32) {
        if !self.is_enabled() {
            return;
        }
        let energy_per_pulse = self.energy_per_pulse;
        self.update(|state| state.record_pulse(now_ms, energy_per_pulse));
    }

    /// Backs the power estimate off when no pulse arrived in time.
    pub fn decay(&self, now_ms: u32) {
        let energy_per_pulse = self.energy_per_pulse;
        self.update(|state| {
            state.apply_decay(now_ms, energy_per_pulse);
        });
    }

    /// Reads power and accumulated pulses, and resets the pulse counter.
    pub fn snapshot(&self) -> Snapshot {
        let (power_watts, pulse_count) = self.update(|state| {
            let taken = (state.power_watts, state.pulse_count);
            state.pulse_count = 0;
            taken
        });

        Snapshot {
            power_watts,
            energy_ws: u64::from(pulse_count) * u64::from(self.energy_per_pulse),
            pulse_count,
        }
    }

    /// Pulses counted since the last snapshot, without resetting them.
    pub fn pulse_count(&self) -> u32 {
        self.runtime_state().pulse_count
    }

    /// Copy of the whole runtime record.
    pub fn runtime_state(&self) -> RuntimeState {
        critical_section::with(|cs| self.state.borrow(cs).get())
    }

    pub fn phase(&self) -> Phase {
        self.runtime_state().phase
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.input.is_some()
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn input(&self) -> Option<&PulseInput> {
        self.input.as_ref()
    }

    pub fn pin(&self) -> Option<u8> {
        self.input.map(|input| input.pin())
    }

    pub fn pulses_per_kwh(&self) -> u32 {
        self.pulses_per_kwh
    }

    /// Energy represented by one pulse, in Ws.
    pub fn energy_per_pulse(&self) -> u32 {
        self.energy_per_pulse
    }

    fn update<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            let result = f(&mut state);
            cell.set(state);
            result
        })
    }
}

/// Copies as many characters of `name` as fit.
fn bounded_name(name: &str) -> ChannelName {
    let mut bounded = ChannelName::new();
    for c in name.chars() {
        if bounded.push(c).is_err() {
            break;
        }
    }
    bounded
}
