use async_trait::async_trait;

use crate::Result;

/// Bit-bang mode of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Mode {
    /// Bit-bang disabled, pins released.
    Reset,
    /// Every written byte is applied to the pins, nothing is sampled.
    Async,
    /// Every written byte produces one sampled byte, taken just before the
    /// written byte is applied.
    Sync,
}

/// A USB bit-bang bridge.
///
/// Implementations must apply written bytes in order, and in [`Mode::Sync`]
/// make exactly one sampled byte available per written byte.
#[async_trait]
pub trait Transport: Send {
    /// Set which of the 8 port pins are outputs.
    async fn set_pin_direction(&mut self, mask: u8) -> Result<()>;

    async fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    async fn set_mode(&mut self, mode: Mode) -> Result<()>;

    /// Drop everything queued in either direction.
    async fn purge(&mut self) -> Result<()>;

    /// Returns how many bytes were accepted. Fewer than `data.len()` means
    /// the transfer failed partway.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Fill `buf` with sampled bytes.
    ///
    /// If the data does not arrive in time this returns
    /// [`crate::Error::Timeout`], with the first `received` bytes of `buf`
    /// valid.
    async fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn set_pin_direction(&mut self, mask: u8) -> Result<()> {
        T::set_pin_direction(&mut *self, mask).await
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        T::set_baud_rate(&mut *self, baud).await
    }

    async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        T::set_mode(&mut *self, mode).await
    }

    async fn purge(&mut self) -> Result<()> {
        T::purge(&mut *self).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        T::write(&mut *self, data).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        T::read(&mut *self, buf).await
    }

    async fn close(&mut self) -> Result<()> {
        T::close(&mut *self).await
    }
}
