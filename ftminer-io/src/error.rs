use crate::jtag::State;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`], used by callers to decide between
/// retrying, re-detecting the chain, or reopening the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Fault {
    /// Open, write, or read failure. The session has to be reopened.
    Transport,
    /// The chain topology is not what we assumed. Run detection again.
    Protocol,
    /// Data did not arrive in time. Retryable.
    Timing,
    /// A bounded result queue was full and a result was dropped.
    Queue,
    /// Invalid pin assignment or configuration value.
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no device {vid:04X}:{pid:04X} at index {index}")]
    DeviceNotFound { vid: u16, pid: u16, index: usize },

    #[error("usb error while {context}")]
    Usb {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("transport accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("read timed out after {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },

    #[error("read stalled after {attempts} attempts")]
    ReadStalled { attempts: usize },

    #[error("no devices detected within {max} bits")]
    NoDevicesDetected { max: usize },

    #[error("idcode {0:08X} not found in device list")]
    UnknownDevice(u32),

    #[error("jtag chain has not been detected")]
    ChainNotDetected,

    #[error("no tap transition from {from:?} to {to:?}")]
    StateTransition { from: State, to: State },

    #[error("{0} is not a tap state")]
    InvalidState(u8),

    #[error("part {part} out of range, chain has {count} devices")]
    PartOutOfRange { part: usize, count: usize },

    #[error("device count changed from {expected} to {found}")]
    UnstableChain { expected: usize, found: usize },

    #[error("pin {0} out of range, expected 0-7")]
    PinOutOfRange(u8),

    #[error("pin {0} assigned more than once")]
    PinConflict(u8),

    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl Error {
    pub fn fault(&self) -> Fault {
        match self {
            Error::DeviceNotFound { .. }
            | Error::Usb { .. }
            | Error::ShortWrite { .. }
            | Error::ReadStalled { .. } => Fault::Transport,
            Error::Timeout { .. } => Fault::Timing,
            Error::NoDevicesDetected { .. }
            | Error::UnknownDevice(_)
            | Error::ChainNotDetected
            | Error::StateTransition { .. }
            | Error::InvalidState(_)
            | Error::PartOutOfRange { .. }
            | Error::UnstableChain { .. } => Fault::Protocol,
            Error::PinOutOfRange(_) | Error::PinConflict(_) | Error::Config(_) => Fault::Config,
        }
    }

    /// Wraps a driver error with what we were doing at the time.
    pub fn usb<E>(context: &'static str) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |source| Self::Usb {
            context,
            source: Box::new(source),
        }
    }
}
