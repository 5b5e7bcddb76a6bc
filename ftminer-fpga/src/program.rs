//! Configuring the FPGAs on a chain from a `.bit` file.

use ftminer_io::{Controller, Link, Progress, Topology, Transport, devices};
use tracing::{debug, info, instrument};

use crate::{Error, Result, instructions};

/// Idle clocks for the configuration memory to clear after JPROGRAM.
const CLEAR_CLOCKS: usize = 10_000;
const STARTUP_CLOCKS: usize = 24;

/// The IDCODE bits that identify the silicon. The top nibble is the stepping.
const PART_MASK: u32 = 0x0fff_ffff;

/// A configuration bitstream and the metadata from its file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitstream {
    pub design_name: String,
    pub part_name: String,
    pub date: String,
    pub time: String,
    /// The part the bitstream was built for, when it is one we know.
    pub idcode: Option<u32>,
    /// Shifted into CFG_IN as is, most significant bit of each byte first.
    pub data: Vec<u8>,
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.0.len() < len {
            return Err(Error::BitFile(what));
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn u16(&mut self, what: &'static str) -> Result<usize> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]).into())
    }

    fn u32(&mut self, what: &'static str) -> Result<usize> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn string(&mut self, what: &'static str) -> Result<String> {
        let len = self.u16(what)?;
        let raw = self.take(len, what)?;
        let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

impl Bitstream {
    /// Parse a Xilinx `.bit` file: a length-prefixed magic field, then
    /// fields tagged `a` (design), `b` (part), `c` (date), `d` (time) and
    /// `e` (configuration data).
    pub fn parse(file: &[u8]) -> Result<Self> {
        let mut r = Reader(file);
        let magic = r.u16("header length")?;
        r.take(magic, "header")?;
        if r.0.starts_with(&[0x00, 0x01]) {
            r.take(2, "header")?;
        }

        let mut ret = Self {
            design_name: String::new(),
            part_name: String::new(),
            date: String::new(),
            time: String::new(),
            idcode: None,
            data: Vec::new(),
        };
        loop {
            match r.take(1, "field tag")?[0] {
                b'a' => ret.design_name = r.string("design name")?,
                b'b' => ret.part_name = r.string("part name")?,
                b'c' => ret.date = r.string("date")?,
                b'd' => ret.time = r.string("time")?,
                b'e' => {
                    let len = r.u32("data length")?;
                    ret.data = r.take(len, "bitstream data")?.to_vec();
                    break;
                }
                _ => return Err(Error::BitFile("unknown field tag")),
            }
        }
        if ret.data.is_empty() {
            return Err(Error::BitFile("empty bitstream"));
        }
        ret.idcode = part_idcode(&ret.part_name);
        debug!(
            design = %ret.design_name,
            part = %ret.part_name,
            idcode = ?ret.idcode,
            len = ret.data.len(),
            "bitstream parsed"
        );
        Ok(ret)
    }

    /// Every device on the chain gets the same bitstream, so every device
    /// has to be the part it was built for.
    pub fn check(&self, topology: &Topology) -> Result<()> {
        let Some(expected) = self.idcode else {
            return Ok(());
        };
        for (part, found) in topology.idcodes().enumerate() {
            if found & PART_MASK != expected & PART_MASK {
                return Err(Error::BitstreamMismatch {
                    expected,
                    found,
                    part,
                });
            }
        }
        Ok(())
    }
}

/// Look up the IDCODE for a part name like `6slx150fgg484`. The longest
/// known name wins, so `6slx150tfgg676` is not taken for an `XC6SLX150`.
fn part_idcode(part_name: &str) -> Option<u32> {
    let part = part_name.to_ascii_lowercase();
    devices::builtin()
        .filter_map(|(idcode, info)| {
            let name = info.name.to_ascii_lowercase();
            let name = name.strip_prefix("xc").unwrap_or(&name);
            part.starts_with(name).then_some((name.len(), idcode.code()))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, idcode)| idcode)
}

async fn load<T: Transport>(link: &mut Link<T>, jtag: &mut Controller, opcode: u32) -> Result<()> {
    jtag.instruction(opcode)?;
    jtag.shift_ir(link, false).await?;
    Ok(())
}

/// Configure the last device on the chain, or every chain `jtag` drives at
/// once. The chain has to be detected. The whole sequence needs the bus to
/// itself.
#[instrument(skip_all, fields(design = %bitstream.design_name))]
pub async fn program<T: Transport>(
    link: &mut Link<T>,
    jtag: &mut Controller,
    bitstream: &Bitstream,
    progress: impl FnMut(Progress),
) -> Result<()> {
    let topology = jtag.topology().ok_or(ftminer_io::Error::ChainNotDetected)?;
    bitstream.check(topology)?;
    let last = topology
        .len()
        .checked_sub(1)
        .ok_or(ftminer_io::Error::ChainNotDetected)?;

    jtag.reset(link);
    jtag.select_part(last)?;
    load(link, jtag, instructions::BYPASS).await?;
    load(link, jtag, instructions::JPROGRAM).await?;
    load(link, jtag, instructions::CFG_IN).await?;
    jtag.run_test(link, CLEAR_CLOCKS)?;

    load(link, jtag, instructions::CFG_IN).await?;
    jtag.shift_dr(link, &[false; 32], false).await?;
    load(link, jtag, instructions::CFG_IN).await?;
    link.flush().await?;
    info!(part = last, len = bitstream.data.len(), "loading bitstream");

    jtag.bulk_shift_dr(link, &bitstream.data, progress).await?;

    load(link, jtag, instructions::JSTART).await?;
    jtag.run_test(link, STARTUP_CLOCKS)?;
    load(link, jtag, instructions::BYPASS).await?;
    load(link, jtag, instructions::BYPASS).await?;
    load(link, jtag, instructions::JSTART).await?;
    jtag.run_test(link, STARTUP_CLOCKS)?;
    link.flush().await?;
    info!("fpga configured");
    Ok(())
}
