//! FT232R bit-bang over USB.

use std::{
    io::ErrorKind,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use nusb::{
    io::{EndpointRead, EndpointWrite},
    transfer::{self, Bulk, ControlOut, ControlType, Recipient},
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{Error, Mode, Result, SpaceHex, Transport};

pub const VID: u16 = 0x0403;
pub const PID: u16 = 0x6001;

const INTERFACE: u8 = 0;
const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;

const CHUNK_SIZE: usize = 4096;
const TIMEOUT: Duration = Duration::from_millis(5000);

/// Every IN packet starts with two modem status bytes.
const STATUS_LEN: usize = 2;

mod requests {
    pub const RESET: u8 = 0;
    pub const SET_FLOW_CTRL: u8 = 2;
    pub const SET_BAUDRATE: u8 = 0x03;
    pub const SET_EVENT_CHAR: u8 = 0x06;
    pub const SET_ERROR_CHAR: u8 = 0x07;
    pub const SET_LATENCY_TIMER: u8 = 0x09;
    pub const SET_BITMODE: u8 = 0x0B;
}

const fn bitmode(mode: Mode) -> u16 {
    match mode {
        Mode::Reset => 0x00,
        Mode::Async => 0x01,
        Mode::Sync => 0x04,
    }
}

/// Baud rate divisor for the 48 MHz R-series clock, as the chip expects it
/// in the `value` (low 16 bits) and `index` (bit 16) of the request.
pub const fn encode_baud(baud: u32) -> u32 {
    const CLOCK: u32 = 48_000_000;
    const FRAC_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

    if baud >= CLOCK / 16 {
        0
    } else if baud >= CLOCK / 24 {
        1
    } else if baud >= CLOCK / 32 {
        2
    } else {
        // eighths of the 3 MHz base rate, rounded
        let divisor = CLOCK / if baud == 0 { 1 } else { baud };
        let mut best = divisor / 2 + (divisor & 1);
        if best > 0x20000 {
            best = 0x1ffff;
        }
        (best >> 3) | FRAC_CODE[(best & 7) as usize] << 14
    }
}

#[tracing::instrument(skip_all)]
fn determine_max_packet_size(iface: &nusb::Interface) -> usize {
    if let Some(desc) = iface.descriptor()
        && let Some(ep) = desc.endpoints().next()
    {
        ep.max_packet_size()
    } else {
        // full speed bulk
        64
    }
}

pub struct Ft232r {
    iface: nusb::Interface,
    writer: EndpointWrite<Bulk>,
    reader: EndpointRead<Bulk>,
    packet_size: usize,
    direction: u8,
    mode: Mode,
    /// Data that arrived past the end of the last read.
    leftover: Vec<u8>,
}

fn reader(iface: &nusb::Interface) -> Result<EndpointRead<Bulk>> {
    Ok(iface
        .endpoint::<transfer::Bulk, transfer::In>(EP_IN)
        .map_err(Error::usb("opening IN endpoint"))?
        .reader(CHUNK_SIZE)
        .with_read_timeout(TIMEOUT))
}

impl Ft232r {
    /// Open the `index`th device matching `vid:pid`.
    #[instrument]
    pub async fn open(vid: u16, pid: u16, index: usize) -> Result<Self> {
        let info = nusb::list_devices()
            .await
            .map_err(Error::usb("listing devices"))?
            .filter(|d| d.vendor_id() == vid && d.product_id() == pid)
            .nth(index)
            .ok_or(Error::DeviceNotFound { vid, pid, index })?;
        let handle = info.open().await.map_err(Error::usb("opening device"))?;

        // errors when no driver is bound
        if let Err(e) = handle.detach_kernel_driver(INTERFACE) {
            debug!(%e, "kernel driver not detached");
        }
        let iface = handle
            .claim_interface(INTERFACE)
            .await
            .map_err(Error::usb("claiming interface"))?;
        let packet_size = determine_max_packet_size(&iface);
        let writer = iface
            .endpoint::<transfer::Bulk, transfer::Out>(EP_OUT)
            .map_err(Error::usb("opening OUT endpoint"))?
            .writer(CHUNK_SIZE)
            .with_write_timeout(TIMEOUT);
        let reader = reader(&iface)?;

        let slf = Self {
            iface,
            writer,
            reader,
            packet_size,
            direction: 0,
            mode: Mode::Reset,
            leftover: Vec::new(),
        };
        slf.init().await?;
        info!(packet_size, "ft232r open");
        Ok(slf)
    }

    #[tracing::instrument(skip_all)]
    async fn init(&self) -> Result<()> {
        const RESET_SIO: u16 = 0x00;
        self.write_control(requests::RESET, RESET_SIO).await?;
        self.flush_rx().await?;
        self.flush_tx().await?;
        // samples come back in small batches, don't sit on them
        self.write_control(requests::SET_LATENCY_TIMER, 2).await?;

        // high byte is enable, low byte is char (if enabled)
        self.write_control(requests::SET_EVENT_CHAR, 0x00_00)
            .await?;
        self.write_control(requests::SET_ERROR_CHAR, 0x00_00)
            .await?;
        self.write_control(requests::SET_FLOW_CTRL, 0).await?;
        self.write_bitmode(Mode::Reset, 0).await
    }

    /// Flush the read buffer on the chip
    async fn flush_rx(&self) -> Result<()> {
        const TCI_FLUSH: u16 = 2;
        self.write_control(requests::RESET, TCI_FLUSH).await
    }

    /// Flush the write buffer on the chip
    async fn flush_tx(&self) -> Result<()> {
        const TCO_FLUSH: u16 = 1;
        self.write_control(requests::RESET, TCO_FLUSH).await
    }

    async fn write_bitmode(&self, mode: Mode, mask: u8) -> Result<()> {
        // high byte is mode, low byte is mask
        let value = bitmode(mode) << 8 | u16::from(mask);
        self.write_control(requests::SET_BITMODE, value).await
    }

    async fn write_control(&self, request: u8, value: u16) -> Result<()> {
        let index = u16::from(self.iface.interface_number()) + 1;
        self.control(request, value, index).await
    }

    #[tracing::instrument(skip(self))]
    async fn control(&self, request: u8, value: u16, index: u16) -> Result<()> {
        let data = ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
            data: &[],
        };
        self.iface
            .control_out(data, TIMEOUT)
            .await
            .map_err(Error::usb("sending control request"))
    }
}

#[async_trait]
impl Transport for Ft232r {
    async fn set_pin_direction(&mut self, mask: u8) -> Result<()> {
        self.direction = mask;
        if self.mode != Mode::Reset {
            self.write_bitmode(self.mode, mask).await?;
        }
        Ok(())
    }

    /// The bridge only runs in bit-bang mode here, where the pins update at
    /// four times the programmed rate.
    async fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let encoded = encode_baud(baud.saturating_mul(4));
        debug!(baud, encoded, "setting baud rate");
        self.control(
            requests::SET_BAUDRATE,
            (encoded & 0xffff) as u16,
            (encoded >> 16) as u16,
        )
        .await
    }

    async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.write_bitmode(mode, self.direction).await?;
        self.mode = mode;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn purge(&mut self) -> Result<()> {
        self.flush_rx().await?;
        self.flush_tx().await?;
        // drop whatever was in flight on the host side too
        self.reader = reader(&self.iface)?;
        self.leftover.clear();
        Ok(())
    }

    #[instrument(skip_all, fields(len = data.len()))]
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for chunk in data.chunks(CHUNK_SIZE) {
            trace!(buf = %SpaceHex(chunk), "writing");
            let r = match self.writer.write_all(chunk).await {
                Ok(()) => self.writer.flush().await,
                Err(e) => Err(e),
            };
            match r {
                Ok(()) => written += chunk.len(),
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    warn!(written, expected = data.len(), "write timed out");
                    break;
                }
                Err(e) => return Err(Error::usb("writing")(e)),
            }
        }
        Ok(written)
    }

    #[instrument(skip_all, fields(len = buf.len()))]
    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let expected = buf.len();
        let mut received = self.leftover.len().min(expected);
        buf[..received].copy_from_slice(&self.leftover[..received]);
        self.leftover.drain(..received);

        let deadline = Instant::now() + TIMEOUT;
        let mut packets = vec![0; CHUNK_SIZE];
        while received < expected {
            let timeout = Error::Timeout { expected, received };
            if Instant::now() >= deadline {
                return Err(timeout);
            }
            let len = match self.reader.read(&mut packets).await {
                Ok(len) => len,
                Err(e) if e.kind() == ErrorKind::TimedOut => return Err(timeout),
                Err(e) => return Err(Error::usb("reading")(e)),
            };
            for packet in packets[..len].chunks(self.packet_size) {
                let data = packet.get(STATUS_LEN..).unwrap_or_default();
                let take = data.len().min(expected - received);
                buf[received..received + take].copy_from_slice(&data[..take]);
                received += take;
                self.leftover.extend_from_slice(&data[take..]);
            }
        }
        trace!(read = %SpaceHex(buf));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .map_err(Error::usb("flushing writes"))?;
        info!("ft232r closed");
        Ok(())
    }
}
