//! Simulated mining firmware behind USER1.
//!
//! Both flavours hand out a cloneable handle so a test can keep feeding
//! nonces after the logic has been moved into the simulated device.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use ftminer_io::{bits_to_u64, sim::UserLogic};

use crate::{
    Job,
    framing::{NONCE_ADDR, READ_REQUEST_BITS, VALID, WORD_BITS, WRITE_FRAME_BITS},
};

const GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

/// The genesis block as a pool would hand it out, and its nonce.
pub fn genesis(target: [u8; 32]) -> (Job, u32) {
    let header = hex::decode(GENESIS).unwrap();
    let nonce = u32::from_be_bytes(header[76..80].try_into().unwrap());
    let mut data = header;
    for word in data.chunks_exact_mut(4) {
        word.reverse();
    }
    let midstate = std::array::from_fn(|i| 0x40 | i as u8);
    (Job::new(midstate, data, target).unwrap(), nonce)
}

/// Difficulty 1.
pub fn share_target() -> [u8; 32] {
    let mut target = [0; 32];
    target[26] = 0xff;
    target[27] = 0xff;
    target
}

#[derive(Debug, Default)]
pub struct LegacyState {
    /// Every non-zero word shifted in.
    pub words: Vec<u16>,
    pub queue: VecDeque<u16>,
}

/// 13-bit register. Shifting in zeros pops the word that was captured.
#[derive(Debug, Clone, Default)]
pub struct Legacy(Arc<Mutex<LegacyState>>);

impl Legacy {
    pub fn state(&self) -> MutexGuard<'_, LegacyState> {
        self.0.lock().unwrap()
    }

    pub fn push_nonce(&self, nonce: u32) {
        let mut state = self.state();
        for (i, tag) in [0xf, 0x7, 0x3, 0x1].into_iter().enumerate() {
            let byte = (nonce >> (8 * i)) as u8;
            state.queue.push_back(VALID | tag << 8 | u16::from(byte));
        }
    }

    pub fn push_word(&self, word: u16) {
        self.state().queue.push_back(word);
    }
}

impl UserLogic for Legacy {
    fn capture(&mut self) -> u64 {
        self.state().queue.front().copied().unwrap_or(0).into()
    }

    fn update(&mut self, bits: &[bool]) {
        let word = bits_to_u64(&bits[bits.len().saturating_sub(WORD_BITS)..]) as u16;
        let mut state = self.state();
        if word == 0 {
            state.queue.pop_front();
        } else {
            state.words.push(word);
        }
    }
}

#[derive(Debug, Default)]
pub struct AddressedState {
    pub registers: [u32; 16],
    pub nonces: VecDeque<u32>,
    pub bad_frames: usize,
    armed: Option<u8>,
}

/// 32-bit registers behind write frames and read requests.
#[derive(Debug, Clone, Default)]
pub struct Addressed(Arc<Mutex<AddressedState>>);

impl Addressed {
    pub fn state(&self) -> MutexGuard<'_, AddressedState> {
        self.0.lock().unwrap()
    }

    pub fn push_nonce(&self, nonce: u32) {
        self.state().nonces.push_back(nonce);
    }
}

impl UserLogic for Addressed {
    fn capture(&mut self) -> u64 {
        let mut state = self.state();
        match state.armed.take() {
            Some(NONCE_ADDR) => state.nonces.pop_front().unwrap_or(0).into(),
            Some(addr) => state.registers[usize::from(addr)].into(),
            None => 0,
        }
    }

    fn update(&mut self, bits: &[bool]) {
        let mut state = self.state();
        if bits.len() >= WRITE_FRAME_BITS {
            let frame = bits_to_u64(&bits[bits.len() - WRITE_FRAME_BITS..]);
            if frame.count_ones() % 2 == 1 && frame >> 36 & 1 == 1 {
                let addr = (frame >> 32 & 0xf) as usize;
                state.registers[addr] = frame as u32;
            } else {
                state.bad_frames += 1;
            }
        } else if bits.len() >= READ_REQUEST_BITS {
            let request = bits_to_u64(&bits[bits.len() - READ_REQUEST_BITS..]);
            // zeros shifted during a read fail the check and are ignored
            if request.count_ones() % 2 == 1 {
                state.armed = Some((request & 0xf) as u8);
            }
        }
    }
}
