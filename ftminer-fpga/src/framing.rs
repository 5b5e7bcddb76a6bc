//! Wire formats of the mining firmware's USER1 register.
//!
//! Older firmware exposes a 13-bit register: jobs go in a byte at a time and
//! nonces come out a byte at a time behind a valid flag and a position tag.
//! Newer firmware reports a revision in USERCODE and exposes 32-bit registers
//! behind 4-bit addresses.

use std::fmt::Display;

use crate::{Error, Job};

/// Width of a legacy register word.
pub const WORD_BITS: usize = 13;
/// Legacy words below this are empty reads.
pub const VALID: u16 = 0x1000;
/// Set on every legacy job word but the first.
const CONTINUE: u16 = 0x100;

pub const WRITE_FRAME_BITS: usize = 38;
pub const READ_REQUEST_BITS: usize = 5;
const WRITE_FLAG: u64 = 1 << 36;

/// Register holding the oldest unread nonce, or zero.
pub const NONCE_ADDR: u8 = 0xE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Legacy,
    Addressed { revision: u8, build: u8 },
}

impl Framing {
    /// An unprogrammed USERCODE or a zero revision byte means legacy
    /// firmware.
    pub fn from_usercode(usercode: u32) -> Self {
        let revision = (usercode >> 8) as u8;
        if usercode == 0xffff_ffff || revision == 0 {
            Self::Legacy
        } else {
            Self::Addressed {
                revision,
                build: usercode as u8,
            }
        }
    }
}

impl Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framing::Legacy => f.write_str("legacy"),
            Framing::Addressed { revision, build } => write!(f, "rev {revision} build {build}"),
        }
    }
}

/// The job as legacy firmware loads it: midstate, then the header tail, both
/// reversed, then a terminating zero.
pub fn legacy_words(job: &Job) -> Vec<u16> {
    job.midstate
        .iter()
        .rev()
        .chain(job.tail().iter().rev())
        .chain([&0])
        .enumerate()
        .map(|(i, byte)| {
            let word = u16::from(*byte);
            if i == 0 { word } else { word | CONTINUE }
        })
        .collect()
}

/// Registers written for a job: midstate to 1-8, header tail to 9-11, as
/// little-endian words.
pub fn job_registers(job: &Job) -> impl Iterator<Item = (u8, u32)> + '_ {
    job.midstate
        .chunks_exact(4)
        .chain(job.tail().chunks_exact(4))
        .zip(1..)
        .map(|(word, addr)| (addr, u32::from_le_bytes([word[0], word[1], word[2], word[3]])))
}

/// Seeded with 1, flipped by every set bit in the low `len` bits.
pub fn checksum(bits: u64, len: usize) -> u64 {
    let masked = bits & ((1 << len) - 1);
    u64::from((1 ^ masked.count_ones()) & 1)
}

/// `data | addr << 32 | write << 36 | checksum << 37`, shifted LSB first.
pub fn write_frame(addr: u8, data: u32) -> u64 {
    let frame = u64::from(data) | u64::from(addr & 0xf) << 32 | WRITE_FLAG;
    frame | checksum(frame, WRITE_FRAME_BITS - 1) << (WRITE_FRAME_BITS - 1)
}

/// `addr | checksum << 4`. The register is read out on the next data shift.
pub fn read_request(addr: u8) -> u64 {
    let request = u64::from(addr & 0xf);
    request | checksum(request, READ_REQUEST_BITS - 1) << (READ_REQUEST_BITS - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// The queue is empty.
    Empty,
    /// Keep reading.
    Pending,
    Nonce(u32),
}

/// Reassembles a nonce from legacy words.
///
/// Each valid word carries one byte and a position tag, `1111` for the least
/// significant byte, then `0111`, `0011`, `0001`. Words before the first
/// `1111` are skipped.
#[derive(Debug, Default)]
pub struct NonceAssembler {
    nonce: u32,
    count: u32,
}

impl NonceAssembler {
    pub fn push(&mut self, word: u16) -> Result<Feed, Error> {
        if word < VALID {
            *self = Self::default();
            return Ok(Feed::Empty);
        }
        let tag = (word >> 8) & 0xf;
        let byte = u32::from(word & 0xff);

        if self.count == 0 {
            if tag == 0xf {
                self.nonce = byte;
                self.count = 1;
            }
            return Ok(Feed::Pending);
        }

        let expected = 0xf >> self.count;
        if tag != expected {
            *self = Self::default();
            return Err(Error::NonceFraming { word, expected });
        }
        self.nonce |= byte << (8 * self.count);
        self.count += 1;
        if tag == 1 {
            let nonce = self.nonce;
            *self = Self::default();
            return Ok(Feed::Nonce(nonce));
        }
        Ok(Feed::Pending)
    }
}
