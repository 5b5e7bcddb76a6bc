use ftminer_io::{Controller, Fault, Hex, Link, Phase, Transport, bits_to_u64, u64_to_bits};
use tracing::{debug, info, instrument, warn};

use crate::{
    Error, Job, Result,
    framing::{
        Feed, Framing, NONCE_ADDR, NonceAssembler, READ_REQUEST_BITS, VALID, WORD_BITS,
        WRITE_FRAME_BITS, job_registers, legacy_words, read_request, write_frame,
    },
    instructions,
};

/// Attempts at sleeping, waking or clearing the queue before giving up.
const TRANSITION_ATTEMPTS: usize = 3;
/// Legacy words read while looking for the start of a nonce.
const MAX_NONCE_WORDS: usize = 32;
/// Reads spent draining a queue that never reports empty.
const MAX_CLEAR_READS: usize = 256;
/// Idle clocks after JSTART or JSHUTDOWN.
const STARTUP_CLOCKS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum Transition {
    Sleep,
    Wake,
    ClearQueue,
}

/// A mining FPGA on a JTAG chain.
///
/// Every operation starts and ends in Test-Logic-Reset with everything
/// flushed, so the bus can change hands between calls.
pub struct Fpga {
    jtag: Controller,
    framing: Framing,
    asleep: bool,
}

impl Fpga {
    /// Detect the chain if that has not happened yet, address `part` and read
    /// its firmware revision.
    #[instrument(skip(link, jtag))]
    pub async fn attach<T: Transport>(
        link: &mut Link<T>,
        mut jtag: Controller,
        part: usize,
    ) -> Result<Self> {
        if jtag.topology().is_none() {
            jtag.detect(link).await?;
        }
        jtag.select_part(part)?;

        jtag.reset(link);
        jtag.instruction(instructions::USERCODE)?;
        jtag.shift_ir(link, false).await?;
        let usercode = bits_to_u64(&jtag.read_dr(link, 32).await?) as u32;
        jtag.reset(link);
        link.flush().await?;

        let framing = Framing::from_usercode(usercode);
        info!(part, usercode = %Hex(usercode), %framing, "fpga attached");
        Ok(Self {
            jtag,
            framing,
            asleep: true,
        })
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn part(&self) -> usize {
        self.jtag.part()
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn controller(&self) -> &Controller {
        &self.jtag
    }

    pub fn into_controller(self) -> Controller {
        self.jtag
    }

    async fn load<T: Transport>(&mut self, link: &mut Link<T>, opcode: u32) -> Result<()> {
        self.jtag.instruction(opcode)?;
        self.jtag.shift_ir(link, false).await?;
        Ok(())
    }

    async fn user_register<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        self.jtag.reset(link);
        self.load(link, instructions::USER1).await
    }

    async fn done<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        self.jtag.reset(link);
        link.flush().await?;
        Ok(())
    }

    async fn wake_if_asleep<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        if self.asleep {
            self.wake(link).await?;
        }
        Ok(())
    }

    /// Put the fabric into its low power shutdown state.
    pub async fn sleep<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        self.transition(link, Transition::Sleep).await?;
        self.asleep = true;
        Ok(())
    }

    pub async fn wake<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        self.transition(link, Transition::Wake).await?;
        self.asleep = false;
        Ok(())
    }

    /// Read nonces until the firmware reports an empty queue. Any nonce still
    /// queued belongs to a job that is no longer current.
    pub async fn clear_queue<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        self.wake_if_asleep(link).await?;
        self.transition(link, Transition::ClearQueue).await
    }

    /// Retry on link failures as long as the chain itself is intact. A
    /// faulted chain has to be detected again, which is the caller's call.
    async fn transition<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        transition: Transition,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            let r = match transition {
                Transition::Sleep => self.try_sleep(link).await,
                Transition::Wake => self.try_wake(link).await,
                Transition::ClearQueue => self.try_clear_queue(link).await,
            };
            match r {
                Err(Error::Jtag(e))
                    if attempt < TRANSITION_ATTEMPTS
                        && self.jtag.phase() != Phase::Faulted
                        && matches!(e.fault(), Fault::Timing | Fault::Transport) =>
                {
                    warn!(%transition, attempt, %e, "retrying");
                    link.transport_mut().purge().await?;
                    attempt += 1;
                }
                r => return r,
            }
        }
    }

    async fn try_sleep<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        debug!(part = self.part(), "going to sleep");
        self.jtag.reset(link);
        self.load(link, instructions::JSHUTDOWN).await?;
        self.jtag.run_test(link, STARTUP_CLOCKS)?;
        self.done(link).await
    }

    async fn try_wake<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        debug!(part = self.part(), "waking up");
        self.jtag.reset(link);
        self.load(link, instructions::BYPASS).await?;
        self.load(link, instructions::BYPASS).await?;
        self.load(link, instructions::JSTART).await?;
        self.jtag.run_test(link, STARTUP_CLOCKS)?;
        self.done(link).await
    }

    async fn try_clear_queue<T: Transport>(&mut self, link: &mut Link<T>) -> Result<()> {
        self.user_register(link).await?;
        let mut cleared = 0;
        let empty = loop {
            if cleared == MAX_CLEAR_READS {
                break false;
            }
            let empty = match self.framing {
                Framing::Legacy => self.read_word(link).await? < VALID,
                Framing::Addressed { .. } => self.read_register(link, NONCE_ADDR).await? == 0,
            };
            if empty {
                break true;
            }
            cleared += 1;
        };
        self.done(link).await?;
        if empty {
            debug!(cleared, "queue cleared");
        } else {
            warn!(cleared, "queue still not empty");
        }
        Ok(())
    }

    /// Load a new job. Work on the previous job stops.
    #[instrument(skip_all, fields(part = self.part()))]
    pub async fn write_job<T: Transport>(&mut self, link: &mut Link<T>, job: &Job) -> Result<()> {
        self.wake_if_asleep(link).await?;
        self.user_register(link).await?;
        match self.framing {
            Framing::Legacy => {
                for word in legacy_words(job) {
                    let bits = u64_to_bits(word.into(), WORD_BITS);
                    self.jtag.shift_dr(link, &bits, false).await?;
                }
            }
            Framing::Addressed { .. } => {
                for (addr, data) in job_registers(job) {
                    let bits = u64_to_bits(write_frame(addr, data), WRITE_FRAME_BITS);
                    self.jtag.shift_dr(link, &bits, false).await?;
                }
            }
        }
        self.done(link).await?;
        debug!("job loaded");
        Ok(())
    }

    /// Take the oldest nonce off the firmware's queue. `None` when the queue
    /// is empty. Never waits for one to show up.
    #[instrument(skip_all, fields(part = self.part()))]
    pub async fn read_nonce<T: Transport>(&mut self, link: &mut Link<T>) -> Result<Option<u32>> {
        self.wake_if_asleep(link).await?;
        self.user_register(link).await?;
        let nonce = match self.framing {
            Framing::Legacy => self.assemble_nonce(link).await?,
            Framing::Addressed { .. } => {
                Some(self.read_register(link, NONCE_ADDR).await?).filter(|nonce| *nonce != 0)
            }
        };
        self.done(link).await?;
        if let Some(nonce) = nonce {
            debug!(nonce = %Hex(nonce), "nonce read");
        }
        Ok(nonce)
    }

    async fn read_word<T: Transport>(&mut self, link: &mut Link<T>) -> Result<u16> {
        let bits = self.jtag.read_dr(link, WORD_BITS).await?;
        Ok(bits_to_u64(&bits) as u16)
    }

    async fn read_register<T: Transport>(&mut self, link: &mut Link<T>, addr: u8) -> Result<u32> {
        let request = u64_to_bits(read_request(addr), READ_REQUEST_BITS);
        self.jtag.shift_dr(link, &request, false).await?;
        let bits = self.jtag.read_dr(link, 32).await?;
        Ok(bits_to_u64(&bits) as u32)
    }

    async fn assemble_nonce<T: Transport>(&mut self, link: &mut Link<T>) -> Result<Option<u32>> {
        let mut assembler = NonceAssembler::default();
        for _ in 0..MAX_NONCE_WORDS {
            let word = self.read_word(link).await?;
            match assembler.push(word) {
                Ok(Feed::Empty) => return Ok(None),
                Ok(Feed::Pending) => {}
                Ok(Feed::Nonce(nonce)) => return Ok(Some(nonce)),
                Err(e) => {
                    warn!(%e, "discarding partial nonce");
                    return Ok(None);
                }
            }
        }
        warn!(words = MAX_NONCE_WORDS, "no nonce start found");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use ftminer_io::{
        Chain, Config, PinAssignment, Pins, Select, devices,
        sim::{SimDevice, SimTransport, UserLogic},
    };

    use super::*;
    use crate::firmware::{Addressed, Legacy};

    fn pins() -> Pins {
        PinAssignment::X6500.pins(Select::Single(Chain::Zero))
    }

    fn job() -> Job {
        let midstate = std::array::from_fn(|i| 0xA0 + i as u8);
        let data = (0..80).map(|i| i as u8).collect();
        Job::new(midstate, data, [0xff; 32]).unwrap()
    }

    fn miner_device(usercode: u32, logic: impl UserLogic + 'static) -> SimDevice {
        SimDevice::spartan6(0x0401D093)
            .with_usercode(usercode)
            .with_user_logic(logic)
    }

    async fn attach(devices: Vec<SimDevice>, part: usize) -> (Link<SimTransport>, Fpga) {
        let sim = SimTransport::new(PinAssignment::X6500).with_chain(Chain::Zero, devices);
        let mut link = Link::open(sim, &PinAssignment::X6500, Config::default())
            .await
            .unwrap();
        let jtag = Controller::new(pins(), devices::table());
        let fpga = Fpga::attach(&mut link, jtag, part).await.unwrap();
        (link, fpga)
    }

    #[test]
    fn legacy_firmware() {
        smol::block_on(async {
            let firmware = Legacy::default();
            let (mut link, mut fpga) =
                attach(vec![miner_device(0xffff_ffff, firmware.clone())], 0).await;
            assert_eq!(fpga.framing(), Framing::Legacy);
            assert!(fpga.is_asleep());

            let job = job();
            fpga.write_job(&mut link, &job).await.unwrap();
            assert!(!fpga.is_asleep());
            assert_eq!(firmware.state().words, legacy_words(&job));

            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), None);
            firmware.push_nonce(0xAABBCCDD);
            firmware.push_nonce(0x01020304);
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), Some(0xAABBCCDD));
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), Some(0x01020304));
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), None);
            assert!(link.buffer().is_empty());
        });
    }

    #[test]
    fn legacy_garbage_is_dropped() {
        smol::block_on(async {
            let firmware = Legacy::default();
            let (mut link, mut fpga) =
                attach(vec![miner_device(0xffff_ffff, firmware.clone())], 0).await;

            // first byte, then a word from the wrong position
            firmware.push_word(VALID | 0xf << 8 | 0x11);
            firmware.push_word(VALID | 0x3 << 8 | 0x22);
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), None);
            assert!(firmware.state().queue.is_empty());

            // leftovers from a nonce that was partly read before
            firmware.push_word(VALID | 0x1 << 8 | 0x33);
            firmware.push_nonce(0xCAFEF00D);
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), Some(0xCAFEF00D));
        });
    }

    #[test]
    fn addressed_firmware() {
        smol::block_on(async {
            let firmware = Addressed::default();
            let (mut link, mut fpga) =
                attach(vec![miner_device(0x0000_0105, firmware.clone())], 0).await;
            assert_eq!(
                fpga.framing(),
                Framing::Addressed {
                    revision: 1,
                    build: 5
                }
            );

            let job = job();
            fpga.write_job(&mut link, &job).await.unwrap();
            {
                let state = firmware.state();
                assert_eq!(state.bad_frames, 0);
                for (addr, data) in job_registers(&job) {
                    assert_eq!(state.registers[usize::from(addr)], data);
                }
            }

            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), None);
            firmware.push_nonce(0x12345678);
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), Some(0x12345678));
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), None);
        });
    }

    #[test]
    fn clear_queue_drains_stale_nonces() {
        smol::block_on(async {
            let legacy = Legacy::default();
            let (mut link, mut fpga) =
                attach(vec![miner_device(0xffff_ffff, legacy.clone())], 0).await;
            for nonce in 1..=3 {
                legacy.push_nonce(nonce);
            }
            fpga.clear_queue(&mut link).await.unwrap();
            assert!(legacy.state().queue.is_empty());

            let addressed = Addressed::default();
            let (mut link, mut fpga) =
                attach(vec![miner_device(0x0000_0201, addressed.clone())], 0).await;
            for nonce in 1..=3 {
                addressed.push_nonce(nonce);
            }
            fpga.clear_queue(&mut link).await.unwrap();
            assert!(addressed.state().nonces.is_empty());
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), None);
        });
    }

    #[test]
    fn clear_queue_survives_a_stall() {
        smol::block_on(async {
            let firmware = Legacy::default();
            let (mut link, mut fpga) =
                attach(vec![miner_device(0xffff_ffff, firmware.clone())], 0).await;
            fpga.wake(&mut link).await.unwrap();
            firmware.push_nonce(7);

            // enough to exhaust the read retries once
            link.transport_mut().stall_reads(4);
            fpga.clear_queue(&mut link).await.unwrap();
            assert!(firmware.state().queue.is_empty());
        });
    }

    #[test]
    fn sleep_and_wake() {
        smol::block_on(async {
            let (mut link, mut fpga) =
                attach(vec![miner_device(0xffff_ffff, Legacy::default())], 0).await;
            fpga.sleep(&mut link).await.unwrap();
            assert!(fpga.is_asleep());
            fpga.wake(&mut link).await.unwrap();
            assert!(!fpga.is_asleep());

            let history = link.transport().device(Chain::Zero, 0).history();
            assert_eq!(
                history[history.len() - 4..],
                [
                    instructions::JSHUTDOWN,
                    instructions::BYPASS,
                    instructions::BYPASS,
                    instructions::JSTART
                ]
            );
        });
    }

    #[test]
    fn second_part_of_a_chain() {
        smol::block_on(async {
            let firmware = Legacy::default();
            let devices = vec![
                SimDevice::spartan6(0x0401D093),
                miner_device(0xffff_ffff, firmware.clone()),
                SimDevice::platform_flash(0x05059093),
            ];
            let (mut link, mut fpga) = attach(devices, 1).await;
            assert_eq!(fpga.part(), 1);

            let job = job();
            fpga.write_job(&mut link, &job).await.unwrap();
            assert_eq!(firmware.state().words, legacy_words(&job));
            firmware.push_nonce(0x0BADBEEF);
            assert_eq!(fpga.read_nonce(&mut link).await.unwrap(), Some(0x0BADBEEF));

            let sim = link.transport();
            assert_eq!(sim.device(Chain::Zero, 0).instruction(), instructions::IDCODE);
        });
    }
}
