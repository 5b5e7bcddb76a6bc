use std::{cmp::Ordering, sync::Arc};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Header bytes covered by the hash, before the nonce.
pub const HEADER_PREFIX: usize = 76;

/// One unit of work, as handed out by the pool.
///
/// `data` is the block header in the pool's byte order: every 32-bit word is
/// byte swapped relative to the serialized header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub midstate: [u8; 32],
    pub data: Vec<u8>,
    pub target: [u8; 32],
}

fn array(field: &'static str, bytes: Vec<u8>) -> Result<[u8; 32]> {
    let len = bytes.len();
    bytes.try_into().map_err(|_| Error::JobField {
        field,
        len,
        expected: 32,
    })
}

impl Job {
    pub fn new(midstate: [u8; 32], data: Vec<u8>, target: [u8; 32]) -> Result<Self> {
        if data.len() < HEADER_PREFIX {
            return Err(Error::ShortJobData(data.len()));
        }
        Ok(Self {
            midstate,
            data,
            target,
        })
    }

    pub fn from_hex(midstate: &str, data: &str, target: &str) -> Result<Self> {
        let decode = |field: &'static str, s: &str| {
            hex::decode(s).map_err(|source| Error::JobHex { field, source })
        };
        Self::new(
            array("midstate", decode("midstate", midstate)?)?,
            decode("data", data)?,
            array("target", decode("target", target)?)?,
        )
    }

    /// The 12 header bytes after the first SHA-256 block: the end of the
    /// merkle root, the time and the bits.
    pub fn tail(&self) -> &[u8] {
        &self.data[64..HEADER_PREFIX]
    }

    /// Double SHA-256 of the header with `nonce` filled in.
    pub fn hash(&self, nonce: u32) -> [u8; 32] {
        let mut header = [0; HEADER_PREFIX + 4];
        for (dst, src) in header
            .chunks_exact_mut(4)
            .zip(self.data[..HEADER_PREFIX].chunks_exact(4))
        {
            dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
        }
        header[HEADER_PREFIX..].copy_from_slice(&nonce.to_be_bytes());
        Sha256::digest(Sha256::digest(header)).into()
    }

    /// Whether `nonce` meets the target. Hash and target compare as
    /// little-endian 256-bit integers.
    pub fn check(&self, nonce: u32) -> bool {
        let hash = self.hash(nonce);
        hash.iter().rev().cmp(self.target.iter().rev()) != Ordering::Greater
    }
}

/// A nonce that met its job's target.
#[derive(Debug, Clone)]
pub struct Golden {
    pub nonce: u32,
    pub job: Arc<Job>,
}
