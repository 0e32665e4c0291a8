use crate::pulse_input::PORT_IDLE_LEVELS;
use crate::registry::{ChannelRegistry, MAX_CHANNELS};
use std::sync::atomic::{AtomicU8, Ordering};

const _: () = assert!(MAX_CHANNELS <= 8, "ChannelSet holds one bit per channel");

/// Set of channel ids, one bit per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, id: u8) {
        self.0 |= 1 << id;
    }

    pub fn contains(&self, id: u8) -> bool {
        usize::from(id) < MAX_CHANNELS && self.0 & (1 << id) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> {
        let bits = self.0;
        (0..MAX_CHANNELS as u8).filter(move |id| bits & (1 << id) != 0)
    }
}

/// Port bits that went from high to low between two readings.
pub fn falling_edges(previous: u8, current: u8) -> u8 {
    previous & !current
}

/// Enabled channels whose input saw a falling edge between `previous` and
/// `current`. Rising edges are ignored.
pub fn pulsed_channels(previous: u8, current: u8, registry: &ChannelRegistry) -> ChannelSet {
    let edges = falling_edges(previous, current);
    let mut pulsed = ChannelSet::empty();

    if edges == 0 {
        return pulsed;
    }

    for channel in registry.enabled() {
        if let Some(input) = channel.input() {
            if edges & (1 << input.port_bit()) != 0 {
                pulsed.insert(channel.id());
            }
        }
    }
    pulsed
}

/// The shared edge handler for the whole pin group.
///
/// Keeps the last observed port pattern; every dispatch compares all
/// channels against one reading and only then stores it.
#[derive(Debug)]
pub struct ChannelDispatcher {
    last_levels: AtomicU8,
}

impl ChannelDispatcher {
    pub const fn new() -> Self {
        Self {
            last_levels: AtomicU8::new(PORT_IDLE_LEVELS),
        }
    }

    /// Handles one "port pattern changed" event with the freshly read
    /// `current` levels. Edge context only.
    pub fn dispatch(&self, current: u8, registry: &ChannelRegistry, now_ms: u32) -> ChannelSet {
        let previous = self.last_levels.load(Ordering::Acquire);
        let pulsed = pulsed_channels(previous, current, registry);

        for id in pulsed.iter() {
            if let Some(channel) = registry.channel(id) {
                channel.on_pulse(now_ms);
            }
        }

        self.last_levels.store(current, Ordering::Release);
        pulsed
    }

    pub fn last_levels(&self) -> u8 {
        self.last_levels.load(Ordering::Acquire)
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
