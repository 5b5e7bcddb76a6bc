use ftminer_io::Fault;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Jtag(#[from] ftminer_io::Error),

    #[error("job data is {0} bytes, need at least 76")]
    ShortJobData(usize),

    #[error("{field} is {len} bytes, expected {expected}")]
    JobField {
        field: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("invalid hex in {field}")]
    JobHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("nonce word {word:04X} out of sequence, expected position {expected:X}")]
    NonceFraming { word: u16, expected: u16 },

    #[error("bitstream is for {expected:08X}, part {part} is {found:08X}")]
    BitstreamMismatch {
        expected: u32,
        found: u32,
        part: usize,
    },

    #[error("malformed bitstream file: {0}")]
    BitFile(&'static str),

    #[error("golden nonce queue full, dropped {nonce:08X}")]
    QueueFull { nonce: u32 },

    #[error("channel disconnected")]
    Disconnected,
}

impl Error {
    pub fn fault(&self) -> Fault {
        match self {
            Error::Jtag(e) => e.fault(),
            Error::NonceFraming { .. } | Error::BitstreamMismatch { .. } => Fault::Protocol,
            Error::ShortJobData(_)
            | Error::JobField { .. }
            | Error::JobHex { .. }
            | Error::BitFile(_) => Fault::Config,
            Error::QueueFull { .. } | Error::Disconnected => Fault::Queue,
        }
    }
}
