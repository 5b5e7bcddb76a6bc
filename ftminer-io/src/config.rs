use crate::{
    Error, Result,
    units::{Bits, Bytes},
};

/// Tunables for the bit-bang link.
///
/// The chunk sizes bound how much is handed to the bridge at once. The FT232R
/// has a 384 byte receive FIFO, but the USB stack buffers well beyond that, so
/// these are throughput knobs rather than hard limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub baud_rate: u32,
    /// Write size when flushing the buffer without readback.
    pub flush_chunk: Bytes<usize>,
    /// Write size when reading back. Must hold whole clocks (3 bytes each).
    pub read_chunk: Bytes<usize>,
    /// Timed out reads to tolerate before giving up on the link.
    pub read_retries: usize,
    /// Encoded bytes per write during bulk shifts. Must hold whole payload
    /// bytes (16 encoded bytes each).
    pub bulk_chunk: Bytes<usize>,
    /// Payload bytes between progress reports during bulk shifts.
    pub progress_every: Bytes<usize>,
    /// Upper bound on the number of devices probed for during detection.
    pub max_chain_bits: Bits<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: 3_000_000,
            flush_chunk: Bytes(4096),
            read_chunk: Bytes(3072),
            read_retries: 3,
            bulk_chunk: Bytes(16 * 1024),
            progress_every: Bytes(16 * 1024),
            max_chain_bits: Bits(100),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::Config("baud rate must be non-zero"));
        }
        if self.flush_chunk.0 == 0 {
            return Err(Error::Config("flush chunk must be non-zero"));
        }
        if self.read_chunk.0 == 0 || self.read_chunk.0 % 3 != 0 {
            return Err(Error::Config("read chunk must be a non-zero multiple of 3"));
        }
        if self.bulk_chunk.0 == 0 || self.bulk_chunk.0 % 16 != 0 {
            return Err(Error::Config("bulk chunk must be a non-zero multiple of 16"));
        }
        if self.progress_every.0 == 0 {
            return Err(Error::Config("progress cadence must be non-zero"));
        }
        if self.max_chain_bits.0 < 2 {
            return Err(Error::Config("device probe needs at least 2 bits"));
        }
        Ok(())
    }
}
