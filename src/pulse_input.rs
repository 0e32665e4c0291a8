use crate::error::ChannelError;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lowest pin number of the shared edge-interrupt group.
pub const PIN_RANGE_MIN: u8 = 24;
/// Highest pin number of the shared edge-interrupt group.
pub const PIN_RANGE_MAX: u8 = 31;

/// Port level pattern with every pull-up released.
pub const PORT_IDLE_LEVELS: u8 = 0xFF;

/// Access to the digital port that carries the S0 inputs.
pub trait PortIo: Send + Sync {
    /// Configures `pin` as a digital input with pull-up.
    fn configure_input_pullup(&self, pin: u8);

    /// Reads the levels of all eight pins of the group in one access.
    fn read_levels(&self) -> u8;
}

/// Edge-interrupt enable bits shared by every pin of the group.
#[derive(Debug, Default)]
pub struct EdgeMask {
    bits: AtomicU8,
}

impl EdgeMask {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    pub fn bits(&self) -> u8 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_set(&self, bit: u8) -> bool {
        self.bits() & (1 << bit) != 0
    }

    // Single atomic RMW per update, sibling bits are never rewritten.
    fn set(&self, bit: u8) {
        self.bits.fetch_or(1 << bit, Ordering::AcqRel);
    }

    fn clear(&self, bit: u8) {
        self.bits.fetch_and(!(1 << bit), Ordering::AcqRel);
    }
}

/// One edge-capable input pin an S0 line is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseInput {
    pin: u8,
}

impl PulseInput {
    /// Validates `pin` against the edge-capable range and configures it as
    /// an input with pull-up.
    pub fn init(pin: u8, port: &dyn PortIo) -> Result<Self, ChannelError> {
        if !(PIN_RANGE_MIN..=PIN_RANGE_MAX).contains(&pin) {
            return Err(ChannelError::PinOutOfRange {
                pin,
                min: PIN_RANGE_MIN,
                max: PIN_RANGE_MAX,
            });
        }
        port.configure_input_pullup(pin);
        Ok(Self { pin })
    }

    pub fn enable(&self, mask: &EdgeMask) {
        mask.set(self.port_bit());
    }

    pub fn disable(&self, mask: &EdgeMask) {
        mask.clear(self.port_bit());
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Bit position of this pin within the port and the edge mask.
    pub fn port_bit(&self) -> u8 {
        self.pin - PIN_RANGE_MIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedPort;

    #[test]
    fn test_init_accepts_whole_range() {
        let port = SimulatedPort::new();
        for pin in PIN_RANGE_MIN..=PIN_RANGE_MAX {
            let input = PulseInput::init(pin, &port).unwrap();
            assert_eq!(input.pin(), pin);
            assert_eq!(input.port_bit(), pin - PIN_RANGE_MIN);
        }
        assert_eq!(port.configured_inputs(), 0xFF);
    }

    #[test]
    fn test_init_rejects_pins_outside_group() {
        let port = SimulatedPort::new();
        for pin in [0, 1, 23, 32, 255] {
            assert_eq!(
                PulseInput::init(pin, &port),
                Err(ChannelError::PinOutOfRange {
                    pin,
                    min: PIN_RANGE_MIN,
                    max: PIN_RANGE_MAX
                })
            );
        }
        assert_eq!(port.configured_inputs(), 0);
    }

    #[test]
    fn test_enable_disable_leaves_siblings_alone() {
        let port = SimulatedPort::new();
        let mask = EdgeMask::new();
        let a = PulseInput::init(24, &port).unwrap();
        let b = PulseInput::init(27, &port).unwrap();
        let c = PulseInput::init(31, &port).unwrap();

        a.enable(&mask);
        b.enable(&mask);
        c.enable(&mask);
        assert_eq!(mask.bits(), 0b1000_1001);

        b.disable(&mask);
        assert_eq!(mask.bits(), 0b1000_0001);
        assert!(mask.is_set(0));
        assert!(!mask.is_set(3));

        // Disabling twice is harmless
        b.disable(&mask);
        a.disable(&mask);
        assert_eq!(mask.bits(), 0b1000_0000);
    }

    #[test]
    fn test_concurrent_mask_updates() {
        let port = SimulatedPort::new();
        let mask = std::sync::Arc::new(EdgeMask::new());
        let handles: Vec<_> = (PIN_RANGE_MIN..=PIN_RANGE_MAX)
            .map(|pin| {
                let input = PulseInput::init(pin, &port).unwrap();
                let mask = mask.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        input.enable(&mask);
                        input.disable(&mask);
                    }
                    input.enable(&mask);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mask.bits(), 0xFF);
    }
}
