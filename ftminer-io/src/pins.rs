use crate::{Error, Result};

/// Physical pin indices of one JTAG chain on the bridge's 8-bit port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPins {
    pub tck: u8,
    pub tms: u8,
    pub tdi: u8,
    pub tdo: u8,
}

impl ChainPins {
    const fn all(self) -> [u8; 4] {
        [self.tck, self.tms, self.tdi, self.tdo]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::VariantArray)]
pub enum Chain {
    #[strum(to_string = "0")]
    Zero,
    #[strum(to_string = "1")]
    One,
}

impl Chain {
    const fn index(self) -> usize {
        self as usize
    }
}

/// Which chain(s) a controller drives. `Both` clocks the two chains in
/// lockstep with identical levels, for broadcast programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select {
    Single(Chain),
    Both,
}

impl std::fmt::Display for Select {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Select::Single(chain) => write!(f, "{chain}"),
            Select::Both => f.write_str("both"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    chains: [ChainPins; 2],
}

impl PinAssignment {
    /// Two-chain board layout: chain 0 on the high nibble, chain 1 on the low.
    pub const X6500: Self = Self {
        chains: [
            ChainPins {
                tck: 7,
                tms: 6,
                tdi: 5,
                tdo: 4,
            },
            ChainPins {
                tck: 3,
                tms: 2,
                tdi: 1,
                tdo: 0,
            },
        ],
    };

    pub fn new(zero: ChainPins, one: ChainPins) -> Result<Self> {
        let mut used = 0u8;
        for pin in zero.all().into_iter().chain(one.all()) {
            if pin > 7 {
                return Err(Error::PinOutOfRange(pin));
            }
            if used & (1 << pin) != 0 {
                return Err(Error::PinConflict(pin));
            }
            used |= 1 << pin;
        }
        Ok(Self {
            chains: [zero, one],
        })
    }

    pub const fn chain(&self, chain: Chain) -> ChainPins {
        self.chains[chain.index()]
    }

    /// Pin direction mask for the bridge, outputs set.
    pub fn output_mask(&self) -> u8 {
        self.chains
            .iter()
            .fold(0, |acc, c| acc | 1 << c.tck | 1 << c.tms | 1 << c.tdi)
    }

    pub fn pins(&self, select: Select) -> Pins {
        match select {
            Select::Single(chain) => Pins::from(self.chain(chain)),
            Select::Both => {
                let zero = Pins::from(self.chain(Chain::Zero));
                let one = Pins::from(self.chain(Chain::One));
                Pins {
                    tck: zero.tck | one.tck,
                    tms: zero.tms | one.tms,
                    tdi: zero.tdi | one.tdi,
                    // readback only ever comes from chain 0
                    tdo: zero.tdo,
                }
            }
        }
    }
}

impl Default for PinAssignment {
    fn default() -> Self {
        Self::X6500
    }
}

/// Bit masks for a chain selection. Encodes one pin state per byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pins {
    tck: u8,
    tms: u8,
    tdi: u8,
    tdo: u8,
}

impl From<ChainPins> for Pins {
    fn from(pins: ChainPins) -> Self {
        Self {
            tck: 1 << pins.tck,
            tms: 1 << pins.tms,
            tdi: 1 << pins.tdi,
            tdo: 1 << pins.tdo,
        }
    }
}

impl Pins {
    pub const fn encode(self, tck: bool, tms: bool, tdi: bool) -> u8 {
        let mut byte = 0;
        if tck {
            byte |= self.tck;
        }
        if tms {
            byte |= self.tms;
        }
        if tdi {
            byte |= self.tdi;
        }
        byte
    }

    /// The TDO level in a sampled port byte.
    pub const fn tdo(self, sample: u8) -> bool {
        sample & self.tdo != 0
    }

    /// Recover `(tck, tms, tdi)` from an encoded byte.
    pub const fn decode(self, byte: u8) -> (bool, bool, bool) {
        (
            byte & self.tck != 0,
            byte & self.tms != 0,
            byte & self.tdi != 0,
        )
    }
}
