use tracing::{debug, instrument, warn};

use crate::{
    Config, Error, Mode, Pins, Result, SpaceHex, Transport,
    jtag::Clock,
};

/// Bytes written per JTAG clock in synchronous mode: TCK low, TCK high, and
/// a hold byte so the bridge's one-byte sampling latency catches TDO.
pub const BYTES_PER_CLOCK: usize = 3;

/// Bytes written per payload bit during bulk shifts: TCK low, TCK high. No
/// hold byte, since nothing is read back.
pub const BULK_BYTES_PER_BIT: usize = 2;

/// Encode `data` for a bulk shift with TMS held low, most significant bit of
/// each byte first.
pub fn encode_bulk(pins: Pins, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 8 * BULK_BYTES_PER_BIT);
    for &byte in data {
        for i in (0..8).rev() {
            let tdi = byte >> i & 1 == 1;
            out.push(pins.encode(false, false, tdi));
            out.push(pins.encode(true, false, tdi));
        }
    }
    out
}

/// Pin-state bytes waiting to be written to the bridge.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    bytes: Vec<u8>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn push_clock(&mut self, pins: Pins, tms: bool, tdi: bool) {
        let low = pins.encode(false, tms, tdi);
        let high = pins.encode(true, tms, tdi);
        self.bytes.extend_from_slice(&[low, high, high]);
    }

    /// A [`Clock`] that appends to this buffer with the given pins.
    pub fn emitter(&mut self, pins: Pins) -> Emitter<'_> {
        Emitter {
            buffer: self,
            pins,
            clocks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop pending bytes without writing them. Returns how many there were.
    pub fn discard(&mut self) -> usize {
        let len = self.bytes.len();
        if len != 0 {
            debug!(len, "discarding pending bytes");
        }
        self.bytes.clear();
        len
    }

    /// Write everything pending, without readback. The buffer is empty
    /// afterwards even if the write fails.
    #[instrument(skip_all, fields(len = self.bytes.len()))]
    pub async fn flush<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        config: &Config,
    ) -> Result<()> {
        if self.bytes.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.bytes);
        let ret = write_async(transport, &bytes, config.flush_chunk.0).await;
        self.bytes = bytes;
        self.bytes.clear();
        ret
    }

    /// Write the pending bytes, reading back TDO for the last `clocks` clocks.
    ///
    /// Everything before those clocks is flushed normally. The rest is written
    /// in synchronous mode and the sample taken during each hold byte gives
    /// one bit, in clock order.
    #[instrument(skip_all, fields(clocks))]
    pub async fn read_last<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        config: &Config,
        pins: Pins,
        clocks: usize,
    ) -> Result<Vec<bool>> {
        let n = (clocks * BYTES_PER_CLOCK).min(self.bytes.len());
        let tail = self.bytes.split_off(self.bytes.len() - n);
        self.flush(transport, config).await?;

        let mut bits = Vec::with_capacity(n / BYTES_PER_CLOCK);
        let mut sampled = vec![0; config.read_chunk.0];
        for chunk in tail.chunks(config.read_chunk.0) {
            write_all(transport, chunk).await?;
            let sampled = &mut sampled[..chunk.len()];
            read_exact(transport, sampled, config.read_retries).await?;
            debug!(read = %SpaceHex(sampled));
            bits.extend(
                sampled
                    .chunks_exact(BYTES_PER_CLOCK)
                    .map(|clock| pins.tdo(clock[BYTES_PER_CLOCK - 1])),
            );
        }
        Ok(bits)
    }
}

pub struct Emitter<'a> {
    buffer: &'a mut WriteBuffer,
    pins: Pins,
    clocks: usize,
}

impl Emitter<'_> {
    /// Clocks emitted through this handle so far.
    pub fn clocks(&self) -> usize {
        self.clocks
    }
}

impl Clock for Emitter<'_> {
    fn clock(&mut self, tms: bool, tdi: bool) {
        self.buffer.push_clock(self.pins, tms, tdi);
        self.clocks += 1;
    }
}

pub(crate) async fn write_all<T: Transport + ?Sized>(transport: &mut T, data: &[u8]) -> Result<()> {
    let written = transport.write(data).await?;
    if written != data.len() {
        return Err(Error::ShortWrite {
            written,
            expected: data.len(),
        });
    }
    Ok(())
}

/// Write without readback: switch to async mode, write, switch back and purge
/// whatever the mode switch left in the queues. The bridge is back in sync
/// mode even when a write fails.
pub(crate) async fn write_async<T: Transport + ?Sized>(
    transport: &mut T,
    data: &[u8],
    chunk_size: usize,
) -> Result<()> {
    transport.set_mode(Mode::Async).await?;
    let r = async {
        for chunk in data.chunks(chunk_size) {
            write_all(transport, chunk).await?;
        }
        Ok::<_, Error>(())
    }
    .await;
    restore_sync(transport).await?;
    r
}

pub(crate) async fn restore_sync<T: Transport + ?Sized>(transport: &mut T) -> Result<()> {
    transport.set_mode(Mode::Sync).await?;
    transport.purge().await
}

/// Timeouts are retried, continuing from the bytes already received, until
/// the budget runs out.
async fn read_exact<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    retries: usize,
) -> Result<()> {
    let mut filled = 0;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match transport.read(&mut buf[filled..]).await {
            Ok(()) => return Ok(()),
            Err(Error::Timeout { expected, received }) if attempts <= retries => {
                warn!(attempts, expected, received, "read timed out, retrying");
                filled += received;
            }
            Err(Error::Timeout { .. }) => return Err(Error::ReadStalled { attempts }),
            Err(e) => return Err(e),
        }
    }
}
