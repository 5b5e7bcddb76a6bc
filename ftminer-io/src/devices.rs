use std::collections::HashMap;

use crate::units::Bits;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct IdCode(u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub irlen: Bits<u8>,
    pub name: &'static str,
}

impl IdCode {
    pub const fn new(code: u32) -> Self {
        /// IEEE 11491-2013, Figure 12-1, "Structure of the device
        /// identification code"
        const VERSION: u32 = 0xf0000000;
        Self(code & !VERSION)
    }

    pub const fn code(self) -> u32 {
        self.0
    }
}

impl From<u32> for IdCode {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<IdCode> for u32 {
    fn from(val: IdCode) -> Self {
        val.code()
    }
}

/// The fields of a raw 32-bit IDCODE, as shifted out of the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fields {
    pub manufacturer: u16,
    pub size: u16,
    pub family: u8,
    pub revision: u8,
}

/// Every IDCODE ends in a `1`. A `0` there means the device is in BYPASS,
/// or the chain is broken.
pub const fn is_valid(code: u32) -> bool {
    code & 1 == 1
}

pub const fn decode(code: u32) -> Fields {
    Fields {
        manufacturer: ((code >> 1) & 0x07ff) as u16,
        size: ((code >> 12) & 0x01ff) as u16,
        family: ((code >> 21) & 0x007f) as u8,
        revision: ((code >> 28) & 0x000f) as u8,
    }
}

/// Returns iterator of `(idcode, info)`. Intended to be collected into a
/// `HashMap`, to be passed to [`crate::Controller::new`].
pub fn builtin() -> impl Iterator<Item = (IdCode, DeviceInfo)> {
    xilinx()
}

/// The builtin table, collected.
pub fn table() -> HashMap<IdCode, DeviceInfo> {
    builtin().collect()
}

fn xilinx() -> impl Iterator<Item = (IdCode, DeviceInfo)> {
    use Bits as B;

    const fn id(code: u32) -> IdCode {
        IdCode::new(code)
    }

    #[rustfmt::skip]
    static DEVICES: &[(IdCode, DeviceInfo)] = &[
        // Spartan-6
        (id(0x04000093), DeviceInfo { irlen: B( 6), name: "XC6SLX4" }),
        (id(0x04001093), DeviceInfo { irlen: B( 6), name: "XC6SLX9" }),
        (id(0x04002093), DeviceInfo { irlen: B( 6), name: "XC6SLX16" }),
        (id(0x04004093), DeviceInfo { irlen: B( 6), name: "XC6SLX25" }),
        (id(0x04024093), DeviceInfo { irlen: B( 6), name: "XC6SLX25T" }),
        (id(0x04008093), DeviceInfo { irlen: B( 6), name: "XC6SLX45" }),
        (id(0x04028093), DeviceInfo { irlen: B( 6), name: "XC6SLX45T" }),
        (id(0x0400E093), DeviceInfo { irlen: B( 6), name: "XC6SLX75" }),
        (id(0x0402E093), DeviceInfo { irlen: B( 6), name: "XC6SLX75T" }),
        (id(0x04011093), DeviceInfo { irlen: B( 6), name: "XC6SLX100" }),
        (id(0x04031093), DeviceInfo { irlen: B( 6), name: "XC6SLX100T" }),
        (id(0x0401D093), DeviceInfo { irlen: B( 6), name: "XC6SLX150" }),
        (id(0x0403D093), DeviceInfo { irlen: B( 6), name: "XC6SLX150T" }),
        // Platform Flash PROMs
        (id(0x05057093), DeviceInfo { irlen: B(16), name: "XCF08P" }),
        (id(0x05058093), DeviceInfo { irlen: B(16), name: "XCF16P" }),
        (id(0x05059093), DeviceInfo { irlen: B(16), name: "XCF32P" }),
    ];

    DEVICES.iter().cloned()
}
