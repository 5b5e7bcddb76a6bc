//! A simulated FT232R in bit-bang mode, wired to up to two chains of
//! simulated TAPs. Used by tests in this crate and downstream.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::{
    Chain, ChainPins, Error, Mode, PinAssignment, Pins, Result, Transport, jtag::State,
    utils::bits_to_u64,
};

/// Logic behind the USER1 data register of a simulated device.
pub trait UserLogic: Send {
    /// Loaded into the register in Capture-DR, shifted out LSB first.
    fn capture(&mut self) -> u64;

    /// Every bit shifted in since Capture-DR, in shift order. Called in
    /// Update-DR.
    fn update(&mut self, bits: &[bool]);
}

/// Instruction opcodes a simulated device responds to. Anything else selects
/// BYPASS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcodes {
    pub idcode: u32,
    pub usercode: u32,
    pub user1: Option<u32>,
    pub cfg_in: Option<u32>,
}

impl Opcodes {
    pub const SPARTAN6: Self = Self {
        idcode: 0b001001,
        usercode: 0b001000,
        user1: Some(0b000010),
        cfg_in: Some(0b000101),
    };

    pub const PLATFORM_FLASH: Self = Self {
        idcode: 0x00FE,
        usercode: 0x00FD,
        user1: None,
        cfg_in: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    Bypass,
    IdCode,
    UserCode,
    User,
    CfgIn,
}

pub struct SimDevice {
    idcode: u32,
    usercode: u32,
    irlen: usize,
    opcodes: Opcodes,
    state: State,
    ir: u64,
    instruction: u32,
    dr: u64,
    dr_len: usize,
    tdo: bool,
    user: Option<Box<dyn UserLogic>>,
    user_in: Vec<bool>,
    cfg_in: Vec<bool>,
    history: Vec<u32>,
}

impl SimDevice {
    pub fn new(idcode: u32, irlen: usize, opcodes: Opcodes) -> Self {
        Self {
            idcode,
            usercode: 0xffff_ffff,
            irlen,
            opcodes,
            state: State::TestLogicReset,
            ir: 0,
            instruction: opcodes.idcode,
            dr: 0,
            dr_len: 1,
            tdo: true,
            user: None,
            user_in: Vec::new(),
            cfg_in: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn spartan6(idcode: u32) -> Self {
        Self::new(idcode, 6, Opcodes::SPARTAN6)
    }

    pub fn platform_flash(idcode: u32) -> Self {
        Self::new(idcode, 16, Opcodes::PLATFORM_FLASH)
    }

    pub fn with_usercode(mut self, usercode: u32) -> Self {
        self.usercode = usercode;
        self
    }

    pub fn with_user_logic(mut self, logic: impl UserLogic + 'static) -> Self {
        self.user = Some(Box::new(logic));
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn instruction(&self) -> u32 {
        self.instruction
    }

    /// Every instruction latched in Update-IR, oldest first.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    /// Every bit shifted into CFG_IN.
    pub fn cfg_in(&self) -> &[bool] {
        &self.cfg_in
    }

    /// CFG_IN bits after the first `skip`, packed MSB first. A trailing
    /// partial byte is dropped.
    pub fn cfg_in_bytes(&self, skip: usize) -> Vec<u8> {
        self.cfg_in
            .get(skip..)
            .unwrap_or_default()
            .chunks_exact(8)
            .map(|byte| byte.iter().fold(0, |acc, bit| acc << 1 | u8::from(*bit)))
            .collect()
    }

    fn register(&self) -> Register {
        let op = self.instruction;
        if op == self.opcodes.idcode {
            Register::IdCode
        } else if op == self.opcodes.usercode {
            Register::UserCode
        } else if Some(op) == self.opcodes.user1 && self.user.is_some() {
            Register::User
        } else if Some(op) == self.opcodes.cfg_in {
            Register::CfgIn
        } else {
            Register::Bypass
        }
    }

    fn rising(&mut self, tms: bool, tdi: bool) {
        match self.state {
            State::CaptureIR => self.ir = 0b01,
            State::ShiftIR => self.ir = (self.ir >> 1) | u64::from(tdi) << (self.irlen - 1),
            State::UpdateIR => {
                self.instruction = (self.ir & ((1 << self.irlen) - 1)) as u32;
                self.history.push(self.instruction);
            }
            State::CaptureDR => {
                let (dr, len) = match self.register() {
                    Register::Bypass | Register::CfgIn => (0, 1),
                    Register::IdCode => (self.idcode.into(), 32),
                    Register::UserCode => (self.usercode.into(), 32),
                    Register::User => {
                        self.user_in.clear();
                        let value = self.user.as_mut().map_or(0, |user| user.capture());
                        (value, 64)
                    }
                };
                self.dr = dr;
                self.dr_len = len;
            }
            State::ShiftDR => {
                match self.register() {
                    Register::User => self.user_in.push(tdi),
                    Register::CfgIn => self.cfg_in.push(tdi),
                    _ => {}
                }
                self.dr = (self.dr >> 1) | u64::from(tdi) << (self.dr_len - 1);
            }
            State::UpdateDR => {
                if self.register() == Register::User
                    && let Some(user) = self.user.as_mut()
                {
                    user.update(&self.user_in);
                }
            }
            _ => {}
        }

        self.state = self.state.next(tms);
        if self.state == State::TestLogicReset {
            self.instruction = self.opcodes.idcode;
        }
    }

    fn falling(&mut self) {
        self.tdo = match self.state {
            State::ShiftIR => self.ir & 1 == 1,
            State::ShiftDR => self.dr & 1 == 1,
            _ => true,
        };
    }
}

#[derive(Default)]
struct SimChain {
    devices: Vec<SimDevice>,
    tck: bool,
}

impl SimChain {
    /// Apply pin levels. Returns true on a rising edge.
    fn apply(&mut self, tck: bool, tms: bool, tdi: bool) -> bool {
        let rising = tck && !self.tck;
        if rising {
            // device 0 is nearest TDI, each device sees its predecessor's TDO
            // as it was before this edge
            let mut input = tdi;
            for device in &mut self.devices {
                let out = device.tdo;
                device.rising(tms, input);
                input = out;
            }
        } else if !tck && self.tck {
            for device in &mut self.devices {
                device.falling();
            }
        }
        self.tck = tck;
        rising
    }

    fn tdo(&self) -> bool {
        self.devices.last().is_none_or(|device| device.tdo)
    }
}

pub struct Cycle {
    pub tms: bool,
    pub tdi: bool,
    pub tdo: bool,
}

fn write_waveform(
    bits: impl Iterator<Item = bool>,
    start: bool,
    top: &mut String,
    bot: &mut String,
) {
    let mut prev = start;
    for b in bits {
        match (prev, b) {
            (true, true) => {
                top.push_str("──");
                bot.push_str("  ");
            }
            (true, false) => {
                top.push_str("─┐");
                bot.push_str(" └");
            }
            (false, true) => {
                top.push_str(" ┌");
                bot.push_str("─┘");
            }
            (false, false) => {
                top.push_str("  ");
                bot.push_str("──");
            }
        }
        prev = b;
    }
}

fn write_clk(len: usize, top: &mut String, bot: &mut String) {
    top.extend(std::iter::repeat_n("┌┐", len));
    bot.extend(std::iter::repeat_n("┘└", len));
}

fn write_cycles(cycles: &[Cycle]) -> String {
    let header = "┌Signals┐┌Waves";
    let footer = "└───────┘└─────";
    let mut tck_top = String::from("│tck    ││");
    let mut tck_bot = String::from("│       ││");
    write_clk(cycles.len(), &mut tck_top, &mut tck_bot);

    let mut rows = vec![(tck_top, tck_bot)];
    let signals: [(&str, fn(&Cycle) -> bool); 3] =
        [("tms", |c| c.tms), ("tdi", |c| c.tdi), ("tdo", |c| c.tdo)];
    for (name, level) in signals {
        let mut top = format!("│{name:<7}││");
        let mut bot = String::from("│       ││");
        write_waveform(cycles.iter().map(level), false, &mut top, &mut bot);
        rows.push((top, bot));
    }

    let wave_width = cycles.len() * 2;
    let mut ret = String::from(header);
    ret.extend(std::iter::repeat_n('─', wave_width.saturating_sub(5)));
    ret.push_str("┐\n");
    for (top, bot) in &rows {
        for buf in [top, bot] {
            ret.push_str(buf);
            ret.push_str("│\n");
        }
    }
    ret.push_str(footer);
    ret.extend(std::iter::repeat_n('─', wave_width.saturating_sub(5)));
    ret.push_str("┘\n");
    ret
}

/// Simulated bridge. Written bytes drive the pins of both chains; in
/// synchronous mode the port is sampled just before each byte is applied.
pub struct SimTransport {
    pins: [ChainPins; 2],
    chains: [SimChain; 2],
    direction: u8,
    baud_rate: u32,
    mode: Mode,
    out: u8,
    samples: VecDeque<u8>,
    writes: Vec<(Mode, usize)>,
    recorded: Option<Vec<(Mode, Vec<u8>)>>,
    write_budget: Option<usize>,
    stalls: usize,
    waveform: Option<Vec<Cycle>>,
    closed: bool,
}

impl SimTransport {
    pub fn new(pins: PinAssignment) -> Self {
        Self {
            pins: [pins.chain(Chain::Zero), pins.chain(Chain::One)],
            chains: Default::default(),
            direction: 0,
            baud_rate: 0,
            mode: Mode::Reset,
            out: 0,
            samples: VecDeque::new(),
            writes: Vec::new(),
            recorded: None,
            write_budget: None,
            stalls: 0,
            waveform: None,
            closed: false,
        }
    }

    pub fn with_chain(mut self, chain: Chain, devices: Vec<SimDevice>) -> Self {
        self.chains[chain as usize].devices = devices;
        self
    }

    /// Record chain 0's signals at every rising edge.
    pub fn with_waveform(mut self) -> Self {
        self.waveform = Some(Vec::new());
        self
    }

    /// Keep the bytes of every accepted write.
    pub fn with_recording(mut self) -> Self {
        self.recorded = Some(Vec::new());
        self
    }

    /// Accept `accepted` more bytes, then cut short the write that goes past
    /// them. Later writes succeed again.
    pub fn fail_after(&mut self, accepted: usize) {
        self.write_budget = Some(accepted);
    }

    /// The next `count` reads time out without delivering anything.
    pub fn stall_reads(&mut self, count: usize) {
        self.stalls = count;
    }

    pub fn device(&self, chain: Chain, index: usize) -> &SimDevice {
        &self.chains[chain as usize].devices[index]
    }

    pub fn device_mut(&mut self, chain: Chain, index: usize) -> &mut SimDevice {
        &mut self.chains[chain as usize].devices[index]
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn direction(&self) -> u8 {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Size of every accepted write, with the mode it was made in.
    pub fn writes(&self) -> &[(Mode, usize)] {
        &self.writes
    }

    /// Accepted writes, when recording.
    pub fn recorded(&self) -> &[(Mode, Vec<u8>)] {
        self.recorded.as_deref().unwrap_or_default()
    }

    pub fn consume_waveform(&mut self) -> String {
        let cycles = self.waveform.get_or_insert_with(Vec::new);
        let ret = write_cycles(cycles);
        cycles.clear();
        ret
    }

    fn sample(&self) -> u8 {
        let mut sample = self.out & self.direction;
        for (pins, chain) in self.pins.iter().zip(&self.chains) {
            if chain.tdo() {
                sample |= 1 << pins.tdo;
            }
        }
        sample
    }

    fn drive(&mut self, byte: u8) {
        self.out = byte;
        let byte = byte & self.direction;
        for (index, (pins, chain)) in self.pins.iter().zip(&mut self.chains).enumerate() {
            let (tck, tms, tdi) = Pins::from(*pins).decode(byte);
            let rising = chain.apply(tck, tms, tdi);
            if rising
                && index == 0
                && let Some(cycles) = self.waveform.as_mut()
            {
                let tdo = chain.tdo();
                cycles.push(Cycle { tms, tdi, tdo });
            }
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn set_pin_direction(&mut self, mask: u8) -> Result<()> {
        self.direction = mask;
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.baud_rate = baud;
        Ok(())
    }

    async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.mode = mode;
        Ok(())
    }

    async fn purge(&mut self) -> Result<()> {
        self.samples.clear();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut accepted = data.len();
        if let Some(budget) = self.write_budget.as_mut() {
            accepted = accepted.min(*budget);
            *budget -= accepted;
            if accepted < data.len() {
                self.write_budget = None;
            }
        }
        for byte in &data[..accepted] {
            match self.mode {
                Mode::Reset => {}
                Mode::Async => self.drive(*byte),
                Mode::Sync => {
                    self.samples.push_back(self.sample());
                    self.drive(*byte);
                }
            }
        }
        self.writes.push((self.mode, accepted));
        if let Some(recorded) = self.recorded.as_mut() {
            recorded.push((self.mode, data[..accepted].to_vec()));
        }
        Ok(accepted)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.stalls > 0 {
            self.stalls -= 1;
            return Err(Error::Timeout {
                expected: buf.len(),
                received: 0,
            });
        }
        let received = self.samples.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.samples.drain(..received)) {
            *dst = src;
        }
        if received < buf.len() {
            return Err(Error::Timeout {
                expected: buf.len(),
                received,
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A 64-bit user register that captures whatever was last shifted into it.
#[derive(Debug, Default)]
pub struct Echo {
    last: u64,
}

impl UserLogic for Echo {
    fn capture(&mut self) -> u64 {
        self.last
    }

    fn update(&mut self, bits: &[bool]) {
        // a longer shift pushes the oldest bits out the far end
        self.last = bits_to_u64(&bits[bits.len().saturating_sub(64)..]);
    }
}
