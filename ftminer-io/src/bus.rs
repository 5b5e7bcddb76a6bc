use smol::lock::{Mutex, MutexGuard};
use tracing::{info, instrument};

use crate::{Config, Emitter, Mode, PinAssignment, Pins, Result, Transport, WriteBuffer};

/// An opened bridge together with its pending write buffer.
///
/// Everything that produces bus traffic takes `&mut Link`, so holding one is
/// holding the bus.
pub struct Link<T> {
    transport: T,
    buffer: WriteBuffer,
    config: Config,
}

impl<T> Link<T> {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn buffer(&self) -> &WriteBuffer {
        &self.buffer
    }

    /// Encode clocks for `pins` into the pending buffer.
    pub fn emitter(&mut self, pins: Pins) -> Emitter<'_> {
        self.buffer.emitter(pins)
    }

    /// Split borrow for code that encodes into the buffer and then talks to
    /// the transport.
    pub(crate) fn parts(&mut self) -> (&mut T, &mut WriteBuffer, &Config) {
        (&mut self.transport, &mut self.buffer, &self.config)
    }
}

impl<T: Transport> Link<T> {
    /// Configure the bridge for synchronous bit-bang on the given pins.
    #[instrument(skip_all)]
    pub async fn open(mut transport: T, pins: &PinAssignment, config: Config) -> Result<Self> {
        config.validate()?;
        transport.set_pin_direction(pins.output_mask()).await?;
        transport.set_baud_rate(config.baud_rate).await?;
        transport.set_mode(Mode::Sync).await?;
        transport.purge().await?;
        info!(baud = config.baud_rate, "link open");
        Ok(Self {
            transport,
            buffer: WriteBuffer::new(),
            config,
        })
    }

    /// Write everything pending.
    pub async fn flush(&mut self) -> Result<()> {
        let (transport, buffer, config) = self.parts();
        buffer.flush(transport, config).await
    }

    /// Flush, release the pins and hand back the transport.
    #[instrument(skip_all)]
    pub async fn close(mut self) -> Result<T> {
        self.flush().await?;
        self.transport.set_mode(Mode::Reset).await?;
        self.transport.close().await?;
        info!("link closed");
        Ok(self.transport)
    }
}

/// Shared access to one [`Link`] from several chain workers.
pub struct Bus<T> {
    link: Mutex<Link<T>>,
}

/// Exclusive use of the bus for one transaction. Released on drop.
pub type Session<'a, T> = MutexGuard<'a, Link<T>>;

impl<T: Transport> Bus<T> {
    pub fn new(link: Link<T>) -> Self {
        Self {
            link: Mutex::new(link),
        }
    }

    /// Wait for the bus. No other chain's traffic can interleave until the
    /// returned session is dropped.
    pub async fn session(&self) -> Session<'_, T> {
        self.link.lock().await
    }

    pub fn into_inner(self) -> Link<T> {
        self.link.into_inner()
    }
}
