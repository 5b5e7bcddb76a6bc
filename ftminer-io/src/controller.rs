use std::{collections::HashMap, ops::Range, time::Instant};

use tracing::{debug, info, instrument, warn};

use crate::{
    BULK_BYTES_PER_BIT, BitStr, Emitter, Error, Hex, Link, Mode, Pins, Result, Transport,
    devices::{self, DeviceInfo, IdCode},
    encode_bulk,
    jtag::{State, Tap},
    pipeline::{restore_sync, write_all},
    utils::bits_to_u64,
};

/// Where a [`Controller`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    Unopened,
    Detected,
    Addressed,
    /// The chain can no longer be driven. Only [`Controller::detect`]
    /// recovers from here.
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub idcode: u32,
    pub info: DeviceInfo,
}

impl Device {
    pub fn irlen(&self) -> usize {
        self.info.irlen.into()
    }
}

/// The devices on one chain. Index 0 is nearest TDI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    devices: Vec<Device>,
}

impl Topology {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn irlens(&self) -> Vec<usize> {
        self.devices.iter().map(Device::irlen).collect()
    }

    /// Length of the chain-wide instruction register.
    pub fn ir_len(&self) -> usize {
        self.devices.iter().map(Device::irlen).sum()
    }

    pub fn idcodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.devices.iter().map(|d| d.idcode)
    }
}

/// Reported during [`Controller::bulk_shift_dr`]. `written` and `total` count
/// payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub start: Instant,
    pub now: Instant,
    pub written: usize,
    pub total: usize,
}

/// Bit positions of `part`'s field in the chain-wide instruction register.
///
/// Bits are in shift order, so the first ones shifted end up in the device
/// nearest TDO.
pub fn ir_field(irlens: &[usize], part: usize) -> Range<usize> {
    let start = irlens.get(part + 1..).unwrap_or_default().iter().sum();
    start..start + irlens.get(part).copied().unwrap_or(0)
}

/// The instruction register vector that loads `opcode` into `part` and
/// BYPASS (all ones) into every other device.
pub fn compose_ir(irlens: &[usize], part: usize, opcode: u32) -> Vec<bool> {
    let mut bits = vec![true; irlens.iter().sum()];
    let field = ir_field(irlens, part);
    for (i, bit) in bits[field].iter_mut().enumerate() {
        *bit = i < 32 && (opcode >> i) & 1 == 1;
    }
    bits
}

/// Encode a full shift through `target` and back to Run-Test/Idle, TMS high
/// on the last bit. Returns the clocks emitted from the first data bit on.
fn encode_shift(tap: &mut Tap, out: &mut Emitter<'_>, target: State, bits: &[bool]) -> Result<usize> {
    let Some(last) = bits.len().checked_sub(1) else {
        return Ok(0);
    };
    tap.goto(out, State::RunTestIdle)?;
    tap.goto(out, target)?;
    let start = out.clocks();
    for (i, bit) in bits.iter().enumerate() {
        tap.step(out, i == last, *bit);
    }
    tap.goto(out, State::RunTestIdle)?;
    Ok(out.clocks() - start)
}

/// Drives one JTAG chain (or both chains in lockstep) over a [`Link`].
///
/// The controller only holds chain state. Traffic goes through whichever
/// link is passed in, so the caller decides how long the bus is held.
pub struct Controller {
    pins: Pins,
    devices: HashMap<IdCode, DeviceInfo>,
    tap: Tap,
    phase: Phase,
    topology: Option<Topology>,
    part: usize,
    ir: Vec<bool>,
}

impl Controller {
    pub fn new(pins: Pins, devices: HashMap<IdCode, DeviceInfo>) -> Self {
        Self {
            pins,
            devices,
            tap: Tap::new(),
            phase: Phase::Unopened,
            topology: None,
            part: 0,
            ir: Vec::new(),
        }
    }

    /// A controller for a chain whose devices are already known, e.g. both
    /// chains driven together after each was detected on its own.
    pub fn with_topology(
        pins: Pins,
        devices: HashMap<IdCode, DeviceInfo>,
        topology: Topology,
    ) -> Self {
        let mut ret = Self::new(pins, devices);
        ret.ir = vec![true; topology.ir_len()];
        ret.topology = Some(topology);
        ret.phase = Phase::Detected;
        ret
    }

    /// Drop everything learned about the chain, e.g. after the link was
    /// closed.
    pub fn forget(&mut self) {
        self.tap.forget();
        self.phase = Phase::Unopened;
        self.topology = None;
        self.part = 0;
        self.ir.clear();
    }

    pub fn pins(&self) -> Pins {
        self.pins
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    pub fn part(&self) -> usize {
        self.part
    }

    pub fn tap_state(&self) -> Option<State> {
        self.tap.state()
    }

    /// The instruction register vector the next [`Controller::shift_ir`]
    /// will load.
    pub fn ir(&self) -> &[bool] {
        &self.ir
    }

    fn detected(&self) -> Result<&Topology> {
        match (&self.topology, self.phase) {
            (Some(topology), Phase::Detected | Phase::Addressed) => Ok(topology),
            _ => Err(Error::ChainNotDetected),
        }
    }

    /// After a failure the TAP may be anywhere and whatever was queued is
    /// stale.
    fn finish<T, R>(&mut self, link: &mut Link<T>, r: Result<R>) -> Result<R> {
        if let Err(e) = &r {
            self.tap.forget();
            link.parts().1.discard();
            if matches!(e, Error::UnknownDevice(_) | Error::ShortWrite { .. }) {
                warn!(%e, "chain faulted");
                self.phase = Phase::Faulted;
                self.topology = None;
                self.ir.clear();
            }
        }
        r
    }

    async fn capture<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        target: State,
        bits: &[bool],
    ) -> Result<Vec<bool>> {
        let clocks = encode_shift(&mut self.tap, &mut link.emitter(self.pins), target, bits)?;
        let (transport, buffer, config) = link.parts();
        let mut read = buffer
            .read_last(transport, config, self.pins, clocks)
            .await?;
        read.truncate(bits.len());
        Ok(read)
    }

    async fn shift<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        target: State,
        bits: &[bool],
        capture: bool,
    ) -> Result<Option<Vec<bool>>> {
        if capture {
            return self.capture(link, target, bits).await.map(Some);
        }
        encode_shift(&mut self.tap, &mut link.emitter(self.pins), target, bits)?;
        Ok(None)
    }

    /// Load BYPASS everywhere, push zeros through, then ones. The number of
    /// zeros that come out before the first one is the number of devices.
    async fn count_devices<T: Transport>(&mut self, link: &mut Link<T>) -> Result<usize> {
        let max = link.config().max_chain_bits.0;
        self.tap.reset(&mut link.emitter(self.pins));
        self.shift(link, State::ShiftIR, &vec![true; max], false)
            .await?;

        let mut pattern = vec![false; max];
        pattern.resize(2 * max, true);
        let read = self.capture(link, State::ShiftDR, &pattern).await?;
        let ones = &read[max..];
        debug!(read = %BitStr(ones));
        match ones[..max - 1].iter().position(|bit| *bit) {
            Some(count) if count > 0 => Ok(count),
            _ => Err(Error::NoDevicesDetected { max }),
        }
    }

    /// Reset selects IDCODE in every device. Returns them nearest TDI first.
    async fn read_idcodes<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        count: usize,
    ) -> Result<Vec<u32>> {
        self.tap.reset(&mut link.emitter(self.pins));
        let read = self
            .capture(link, State::ShiftDR, &vec![true; 32 * count])
            .await?;
        // the device nearest TDO shifts out first
        let mut idcodes = read
            .chunks_exact(32)
            .map(|word| bits_to_u64(word) as u32)
            .collect::<Vec<_>>();
        idcodes.reverse();
        Ok(idcodes)
    }

    fn lookup(&self, idcode: u32) -> Result<Device> {
        if !devices::is_valid(idcode) {
            warn!(idcode = %Hex(idcode), "idcode marker bit is clear");
        }
        let info = self
            .devices
            .get(&IdCode::new(idcode))
            .ok_or(Error::UnknownDevice(idcode))?;
        Ok(Device {
            idcode,
            info: info.clone(),
        })
    }

    /// Count the devices on the chain, read their IDCODEs and look up their
    /// instruction register lengths. Leaves every device in BYPASS-equivalent
    /// reset with part 0 selected.
    #[instrument(skip_all)]
    pub async fn detect<T: Transport>(&mut self, link: &mut Link<T>) -> Result<&Topology> {
        self.topology = None;
        self.ir.clear();
        let r = async {
            let count = self.count_devices(link).await?;
            debug!(count, "devices counted");
            let idcodes = self.read_idcodes(link, count).await?;
            let devices = idcodes
                .into_iter()
                .map(|idcode| self.lookup(idcode))
                .collect::<Result<Vec<_>>>()?;
            self.tap.reset(&mut link.emitter(self.pins));
            link.flush().await?;
            Ok(Topology::new(devices))
        }
        .await;
        let topology = self.finish(link, r)?;

        for (i, device) in topology.devices().iter().enumerate() {
            info!(
                part = i,
                idcode = %Hex(device.idcode),
                name = device.info.name,
                irlen = device.irlen(),
                "found device"
            );
        }
        self.part = 0;
        self.phase = Phase::Detected;
        self.ir = vec![true; topology.ir_len()];
        Ok(self.topology.insert(topology))
    }

    /// Address `part` with the following instructions. No bus traffic.
    pub fn select_part(&mut self, part: usize) -> Result<()> {
        let count = self.detected()?.len();
        if part >= count {
            return Err(Error::PartOutOfRange { part, count });
        }
        self.part = part;
        self.phase = Phase::Addressed;
        Ok(())
    }

    /// Compose the instruction register vector for the selected part. No bus
    /// traffic until [`Controller::shift_ir`].
    pub fn instruction(&mut self, opcode: u32) -> Result<()> {
        let irlens = self.detected()?.irlens();
        self.ir = compose_ir(&irlens, self.part, opcode);
        debug!(opcode = %Hex(opcode), part = self.part, ir = %BitStr(&self.ir));
        Ok(())
    }

    pub async fn shift_ir<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        capture: bool,
    ) -> Result<Option<Vec<bool>>> {
        self.detected()?;
        let bits = self.ir.clone();
        let r = self.shift(link, State::ShiftIR, &bits, capture).await;
        self.finish(link, r)
    }

    /// Shift `bits` through the selected part's data register, every other
    /// device in BYPASS. Captured bits are the selected part's.
    pub async fn shift_dr<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        bits: &[bool],
        capture: bool,
    ) -> Result<Option<Vec<bool>>> {
        let count = self.detected()?.len();
        let before = count - 1 - self.part;
        let mut padded = vec![false; before];
        padded.extend_from_slice(bits);
        padded.resize(padded.len() + self.part, false);

        let r = self.shift(link, State::ShiftDR, &padded, capture).await;
        let r = r.map(|read| read.map(|read| read[before..before + bits.len()].to_vec()));
        self.finish(link, r)
    }

    /// Shift `len` zeros through the selected part's data register and return
    /// what came out.
    pub async fn read_dr<T: Transport>(&mut self, link: &mut Link<T>, len: usize) -> Result<Vec<bool>> {
        Ok(self
            .shift_dr(link, &vec![false; len], true)
            .await?
            .unwrap_or_default())
    }

    /// Clock `cycles` times in Run-Test/Idle. Queued, not flushed.
    pub fn run_test<T>(&mut self, link: &mut Link<T>, cycles: usize) -> Result<()> {
        let mut out = link.emitter(self.pins);
        self.tap.goto(&mut out, State::RunTestIdle)?;
        for _ in 0..cycles {
            self.tap.step(&mut out, false, false);
        }
        Ok(())
    }

    /// Drive the TAP to Test-Logic-Reset and start the instruction register
    /// over at all BYPASS. Queued, not flushed.
    pub fn reset<T>(&mut self, link: &mut Link<T>) {
        self.tap.reset(&mut link.emitter(self.pins));
        let len = self.topology.as_ref().map_or(0, Topology::ir_len);
        self.ir = vec![true; len];
    }

    /// Shift a large payload into the selected part's data register, most
    /// significant bit of each byte first, without readback.
    ///
    /// The body is written in asynchronous mode in chunks of
    /// [`crate::Config::bulk_chunk`] encoded bytes. The last byte carries the
    /// exit from Shift-DR and goes through the normal buffer. A short write
    /// faults the chain: the device has to be programmed again from the start.
    #[instrument(skip_all, fields(len = data.len()))]
    pub async fn bulk_shift_dr<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        data: &[u8],
        mut progress: impl FnMut(Progress),
    ) -> Result<()> {
        let count = self.detected()?.len();
        let part = self.part;
        let pins = self.pins;
        let start = Instant::now();
        let total = data.len();

        let r = async {
            let Some((last, body)) = data.split_last() else {
                return Ok(());
            };

            let mut out = link.emitter(pins);
            self.tap.goto(&mut out, State::RunTestIdle)?;
            self.tap.goto(&mut out, State::ShiftDR)?;
            for _ in part + 1..count {
                self.tap.step(&mut out, false, false);
            }
            link.flush().await?;

            let per_chunk = link.config().bulk_chunk.0 / (8 * BULK_BYTES_PER_BIT);
            let chunks = body
                .chunks(per_chunk)
                .map(|chunk| encode_bulk(pins, chunk))
                .collect::<Vec<_>>();
            debug!(chunks = chunks.len(), per_chunk, "payload encoded");

            let every = link.config().progress_every.0;
            let transport = link.transport_mut();
            transport.set_mode(Mode::Async).await?;
            let r = async {
                let mut written = 0;
                for chunk in &chunks {
                    write_all(transport, chunk).await?;
                    let before = written;
                    written += chunk.len() / (8 * BULK_BYTES_PER_BIT);
                    if written / every != before / every {
                        progress(Progress {
                            start,
                            now: Instant::now(),
                            written,
                            total,
                        });
                    }
                }
                Ok::<_, Error>(())
            }
            .await;
            restore_sync(transport).await?;
            r?;

            let tail = (0..8)
                .rev()
                .map(|i| *last >> i & 1 == 1)
                .chain(std::iter::repeat_n(false, part))
                .collect::<Vec<_>>();
            let mut out = link.emitter(pins);
            let end = tail.len() - 1;
            for (i, bit) in tail.iter().enumerate() {
                self.tap.step(&mut out, i == end, *bit);
            }
            self.tap.goto(&mut out, State::RunTestIdle)?;
            link.flush().await
        }
        .await;
        self.finish(link, r)?;

        progress(Progress {
            start,
            now: Instant::now(),
            written: total,
            total,
        });
        info!(
            len = total,
            elapsed = ?start.elapsed(),
            "bulk shift complete"
        );
        Ok(())
    }

    /// Run detection `count` more times, failing if the number of devices
    /// ever changes. Returns the device count.
    #[instrument(skip_all, fields(count))]
    pub async fn stress_test<T: Transport>(
        &mut self,
        link: &mut Link<T>,
        count: usize,
    ) -> Result<usize> {
        let expected = self.detect(link).await?.len();
        let mut reported = 0;
        for i in 1..=count {
            let found = self.detect(link).await?.len();
            if found != expected {
                return Err(Error::UnstableChain { expected, found });
            }
            let percent = i * 100 / count;
            if percent != reported {
                debug!(percent, "stress test");
                reported = percent;
            }
        }
        info!(count, devices = expected, "chain stable");
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Chain, Config, PinAssignment, Select,
        sim::{Echo, SimDevice, SimTransport},
        u64_to_bits,
        units::Bytes,
    };

    const USER1: u32 = 0b000010;
    const CFG_IN: u32 = 0b000101;

    fn pins() -> Pins {
        PinAssignment::X6500.pins(Select::Single(Chain::Zero))
    }

    fn controller() -> Controller {
        Controller::new(pins(), devices::table())
    }

    async fn open(devices: Vec<SimDevice>, config: Config) -> Link<SimTransport> {
        let sim = SimTransport::new(PinAssignment::X6500).with_chain(Chain::Zero, devices);
        Link::open(sim, &PinAssignment::X6500, config).await.unwrap()
    }

    #[test]
    fn detects_chains_of_any_length() {
        smol::block_on(async {
            for count in [1, 2, 5] {
                let codes = (0..count)
                    .map(|i| if i % 2 == 0 { 0x0401D093 } else { 0x24004093 })
                    .collect::<Vec<_>>();
                let sims = codes.iter().map(|c| SimDevice::spartan6(*c)).collect();
                let mut link = open(sims, Config::default()).await;
                let mut jtag = controller();

                let topology = jtag.detect(&mut link).await.unwrap();
                assert_eq!(topology.idcodes().collect::<Vec<_>>(), codes);
                assert_eq!(topology.irlens(), vec![6; count]);
                assert_eq!(jtag.phase(), Phase::Detected);
                assert_eq!(jtag.tap_state(), Some(State::TestLogicReset));
                assert!(link.buffer().is_empty());
            }
        });
    }

    #[test]
    fn empty_chain_is_not_detected() {
        smol::block_on(async {
            let mut link = open(Vec::new(), Config::default()).await;
            let mut jtag = controller();
            let err = jtag.detect(&mut link).await.unwrap_err();
            assert!(matches!(err, Error::NoDevicesDetected { max: 100 }));
            assert_eq!(jtag.tap_state(), None);
            assert!(jtag.instruction(USER1).is_err());
        });
    }

    #[test]
    fn unknown_device_faults_the_chain() {
        smol::block_on(async {
            let sims = vec![SimDevice::spartan6(0x0401D093), SimDevice::spartan6(0x0362D093)];
            let mut link = open(sims, Config::default()).await;
            let mut jtag = controller();
            let err = jtag.detect(&mut link).await.unwrap_err();
            assert!(matches!(err, Error::UnknownDevice(0x0362D093)));
            assert_eq!(err.fault(), crate::Fault::Protocol);
            assert_eq!(jtag.phase(), Phase::Faulted);
            assert!(jtag.topology().is_none());
            assert!(matches!(
                jtag.select_part(0),
                Err(Error::ChainNotDetected)
            ));
        });
    }

    #[test]
    fn addresses_one_part_of_a_mixed_chain() {
        smol::block_on(async {
            let sims = vec![
                SimDevice::spartan6(0x0403D093),
                SimDevice::platform_flash(0x05057093),
            ];
            let mut link = open(sims, Config::default()).await;
            let mut jtag = controller();
            jtag.detect(&mut link).await.unwrap();
            assert_eq!(jtag.topology().unwrap().irlens(), [6, 16]);

            jtag.select_part(1).unwrap();
            jtag.instruction(0x00FD).unwrap();
            let ir = jtag.ir();
            assert_eq!(ir.len(), 22);
            assert_eq!(bits_to_u64(&ir[..16]), 0x00FD);
            assert!(ir[16..].iter().all(|bit| *bit));

            jtag.select_part(0).unwrap();
            jtag.instruction(USER1).unwrap();
            jtag.shift_ir(&mut link, false).await.unwrap();
            link.flush().await.unwrap();
            let sim = link.transport();
            assert_eq!(sim.device(Chain::Zero, 0).instruction(), USER1);
            assert_eq!(sim.device(Chain::Zero, 1).instruction(), 0xFFFF);
            assert_eq!(jtag.tap_state(), Some(State::RunTestIdle));

            assert!(matches!(
                jtag.select_part(2),
                Err(Error::PartOutOfRange { part: 2, count: 2 })
            ));
        });
    }

    #[test]
    fn ir_fields_cover_the_register() {
        for count in 1..=8 {
            let irlens = (0..count)
                .map(|i| if i % 3 == 1 { 16 } else { 6 })
                .collect::<Vec<usize>>();
            for part in 0..count {
                let opcode = 0b10_0110;
                let bits = compose_ir(&irlens, part, opcode);
                assert_eq!(bits.len(), irlens.iter().sum::<usize>());

                let field = ir_field(&irlens, part);
                assert_eq!(field.len(), irlens[part]);
                assert_eq!(bits_to_u64(&bits[field.clone()]), u64::from(opcode));
                let others = bits
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !field.contains(i));
                assert!(others.clone().all(|(_, bit)| *bit), "{count} {part}");
            }
        }
        assert!(compose_ir(&[6, 6], 2, 0).iter().all(|bit| *bit));
    }

    #[test]
    fn data_register_capture_skips_bypassed_parts() {
        smol::block_on(async {
            let sims = vec![
                SimDevice::spartan6(0x0401D093).with_user_logic(Echo::default()),
                SimDevice::spartan6(0x0401D093),
                SimDevice::platform_flash(0x05059093),
            ];
            let mut link = open(sims, Config::default()).await;
            let mut jtag = controller();
            jtag.detect(&mut link).await.unwrap();

            jtag.select_part(0).unwrap();
            jtag.instruction(USER1).unwrap();
            jtag.shift_ir(&mut link, false).await.unwrap();

            let value = 0xDEAD_BEEF_1234_5678;
            let none = jtag
                .shift_dr(&mut link, &u64_to_bits(value, 64), false)
                .await
                .unwrap();
            assert!(none.is_none());
            let read = jtag.read_dr(&mut link, 64).await.unwrap();
            assert_eq!(read.len(), 64);
            assert_eq!(bits_to_u64(&read), value);
            assert_eq!(jtag.tap_state(), Some(State::RunTestIdle));
        });
    }

    #[test]
    fn bulk_shift_round_trips() {
        smol::block_on(async {
            let config = Config {
                bulk_chunk: Bytes(8 * 1024),
                progress_every: Bytes(64 * 1024),
                ..Config::default()
            };
            let sims = vec![
                SimDevice::platform_flash(0x05059093),
                SimDevice::spartan6(0x0401D093),
            ];
            let sim = SimTransport::new(PinAssignment::X6500)
                .with_chain(Chain::Zero, sims)
                .with_recording();
            let mut link = Link::open(sim, &PinAssignment::X6500, config)
                .await
                .unwrap();
            let mut jtag = controller();
            jtag.detect(&mut link).await.unwrap();
            jtag.select_part(1).unwrap();
            jtag.instruction(CFG_IN).unwrap();
            jtag.shift_ir(&mut link, false).await.unwrap();

            let data = (0..1024 * 1024)
                .map(|i: u32| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
                .collect::<Vec<_>>();
            let mut reports = Vec::new();
            jtag.bulk_shift_dr(&mut link, &data, |p| reports.push((p.written, p.total)))
                .await
                .unwrap();

            // every 64 KiB of the body, then once at the end
            assert_eq!(reports.len(), 16);
            assert_eq!(reports[0].0, 64 * 1024);
            assert_eq!(*reports.last().unwrap(), (data.len(), data.len()));
            assert_eq!(jtag.tap_state(), Some(State::RunTestIdle));

            let sim = link.transport();
            assert_eq!(sim.mode(), Mode::Sync);
            let async_writes = sim
                .writes()
                .iter()
                .filter(|(mode, len)| *mode == Mode::Async && *len == 8 * 1024)
                .count();
            assert_eq!(async_writes, 2047);
            let loaded = sim.device(Chain::Zero, 1).cfg_in_bytes(1);
            assert_eq!(loaded.len(), data.len());
            assert!(loaded == data);

            // the body goes out as consecutive async chunks; decoding the
            // wire bytes gives back everything but the last payload byte
            let recorded = sim.recorded();
            let first = recorded
                .iter()
                .position(|(_, bytes)| bytes.len() == 8 * 1024)
                .unwrap();
            let wire = recorded[first..first + 2048]
                .iter()
                .flat_map(|(mode, bytes)| {
                    assert_eq!(*mode, Mode::Async);
                    bytes.iter().copied()
                })
                .collect::<Vec<_>>();
            assert_eq!(wire.len(), (data.len() - 1) * 8 * BULK_BYTES_PER_BIT);
            let pins = pins();
            let bits = wire
                .chunks_exact(BULK_BYTES_PER_BIT)
                .map(|edge| {
                    let (tck_low, tms_low, tdi) = pins.decode(edge[0]);
                    let (tck_high, tms_high, tdi_high) = pins.decode(edge[1]);
                    assert!(!tck_low && tck_high);
                    assert!(!tms_low && !tms_high);
                    assert_eq!(tdi, tdi_high);
                    tdi
                })
                .collect::<Vec<_>>();
            let decoded = bits
                .chunks_exact(8)
                .map(|byte| byte.iter().fold(0u8, |acc, bit| acc << 1 | u8::from(*bit)))
                .collect::<Vec<_>>();
            assert!(decoded == data[..data.len() - 1]);
        });
    }

    #[test]
    fn short_bulk_write_faults() {
        smol::block_on(async {
            let mut link = open(vec![SimDevice::spartan6(0x0401D093)], Config::default()).await;
            let mut jtag = controller();
            jtag.detect(&mut link).await.unwrap();
            jtag.instruction(CFG_IN).unwrap();
            jtag.shift_ir(&mut link, false).await.unwrap();
            link.flush().await.unwrap();

            // three clocks reach Shift-DR, then the first chunk comes up short
            link.transport_mut().fail_after(9 + 100);
            let err = jtag
                .bulk_shift_dr(&mut link, &[0x55; 4096], |_| {})
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::ShortWrite {
                    written: 100,
                    expected: 16384
                }
            ));
            assert_eq!(jtag.phase(), Phase::Faulted);
            assert_eq!(jtag.tap_state(), None);
            assert!(link.buffer().is_empty());
            // back in sync mode even though the async write failed
            assert_eq!(link.transport().mode(), Mode::Sync);
            assert_eq!(link.transport().writes().last(), Some(&(Mode::Async, 100)));

            // detection recovers
            jtag.detect(&mut link).await.unwrap();
            assert_eq!(jtag.phase(), Phase::Detected);
        });
    }

    #[test]
    fn run_test_stays_in_idle() {
        smol::block_on(async {
            let mut link = open(vec![SimDevice::spartan6(0x0401D093)], Config::default()).await;
            let mut jtag = controller();
            jtag.detect(&mut link).await.unwrap();
            let before = link.buffer().len();
            jtag.run_test(&mut link, 24).unwrap();
            // one clock from reset to idle, then 24 in idle
            assert_eq!(link.buffer().len() - before, 25 * crate::BYTES_PER_CLOCK);
            link.flush().await.unwrap();
            assert_eq!(
                link.transport().device(Chain::Zero, 0).state(),
                State::RunTestIdle
            );

            jtag.reset(&mut link);
            assert_eq!(jtag.tap_state(), Some(State::TestLogicReset));
            assert_eq!(jtag.ir(), [true; 6]);
        });
    }

    #[test]
    fn stress_test_counts_devices() {
        smol::block_on(async {
            let sims = vec![SimDevice::spartan6(0x0401D093), SimDevice::spartan6(0x0401D093)];
            let mut link = open(sims, Config::default()).await;
            let mut jtag = controller();
            assert_eq!(jtag.stress_test(&mut link, 3).await.unwrap(), 2);
        });
    }

    #[test]
    fn stalled_reads_escalate() {
        smol::block_on(async {
            let mut link = open(vec![SimDevice::spartan6(0x0401D093)], Config::default()).await;
            let mut jtag = controller();
            link.transport_mut().stall_reads(10);
            let err = jtag.detect(&mut link).await.unwrap_err();
            assert!(matches!(err, Error::ReadStalled { attempts: 4 }));
            assert_eq!(err.fault(), crate::Fault::Transport);
            assert_eq!(jtag.phase(), Phase::Unopened);

            link.transport_mut().stall_reads(0);
            link.transport_mut().purge().await.unwrap();
            jtag.detect(&mut link).await.unwrap();
        });
    }

    #[test]
    fn both_chains_in_lockstep() {
        smol::block_on(async {
            let sim = SimTransport::new(PinAssignment::X6500)
                .with_chain(Chain::Zero, vec![SimDevice::spartan6(0x0401D093)])
                .with_chain(Chain::One, vec![SimDevice::spartan6(0x0401D093)]);
            let mut link = Link::open(sim, &PinAssignment::X6500, Config::default())
                .await
                .unwrap();
            let topology = controller().detect(&mut link).await.unwrap().clone();

            let both = PinAssignment::X6500.pins(Select::Both);
            let mut jtag = Controller::with_topology(both, devices::table(), topology);
            jtag.instruction(CFG_IN).unwrap();
            jtag.shift_ir(&mut link, false).await.unwrap();
            jtag.bulk_shift_dr(&mut link, &[0xA5, 0x3C], |_| {})
                .await
                .unwrap();

            let sim = link.transport();
            for chain in [Chain::Zero, Chain::One] {
                assert_eq!(sim.device(chain, 0).cfg_in_bytes(0), [0xA5, 0x3C]);
            }
        });
    }
}
