//! Spartan-6 JTAG instruction opcodes, 6 bits wide.

pub const USER1: u32 = 0x02;
pub const CFG_IN: u32 = 0x05;
pub const USERCODE: u32 = 0x08;
pub const IDCODE: u32 = 0x09;
pub const JPROGRAM: u32 = 0x0b;
pub const JSTART: u32 = 0x0c;
pub const JSHUTDOWN: u32 = 0x0d;
pub const BYPASS: u32 = 0x3f;
