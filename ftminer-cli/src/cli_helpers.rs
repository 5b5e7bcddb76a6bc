use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use color_eyre::eyre::{OptionExt, bail};
use ftminer_io::{Chain, ChainPins, PinAssignment, Select};

#[derive(Debug, Clone, Copy)]
pub struct UsbAddr {
    pub vid: u16,
    pub pid: u16,
}

impl FromStr for UsbAddr {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (vid, pid) = s.split_once(':').ok_or_eyre("no ':'")?;
        let vid = u16::from_str_radix(vid, 16)?;
        let pid = u16::from_str_radix(pid, 16)?;
        Ok(Self { vid, pid })
    }
}

impl Display for UsbAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

/// `0`, `1` or `both`.
#[derive(Debug, Clone, Copy)]
pub struct ChainArg(pub Select);

impl ChainArg {
    /// The chains to visit one at a time.
    pub fn chains(self) -> Vec<Chain> {
        match self.0 {
            Select::Single(chain) => vec![chain],
            Select::Both => vec![Chain::Zero, Chain::One],
        }
    }
}

impl FromStr for ChainArg {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let select = match s {
            "0" => Select::Single(Chain::Zero),
            "1" => Select::Single(Chain::One),
            "both" | "2" => Select::Both,
            _ => bail!("expected 0, 1 or both"),
        };
        Ok(Self(select))
    }
}

impl Display for ChainArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// `tck,tms,tdi,tdo` for chain 0, then the same for chain 1.
#[derive(Debug, Clone, Copy)]
pub struct PinsArg(pub PinAssignment);

impl FromStr for PinsArg {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let pins = s
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<Vec<_>, _>>()?;
        let [a, b, c, d, e, f, g, h] = pins[..] else {
            bail!("expected 8 pins, got {}", pins.len());
        };
        let chain = |tck, tms, tdi, tdo| ChainPins { tck, tms, tdi, tdo };
        Ok(Self(PinAssignment::new(chain(a, b, c, d), chain(e, f, g, h))?))
    }
}
