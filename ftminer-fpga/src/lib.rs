mod error;
#[cfg(test)]
mod firmware;
mod fpga;
pub mod framing;
pub mod instructions;
mod job;
pub mod program;
pub mod worker;

pub use crate::{
    error::{Error, Result},
    fpga::Fpga,
    framing::Framing,
    job::{Golden, HEADER_PREFIX, Job},
    program::{Bitstream, program},
    worker::{JobSender, Miner, Stats, StatsSnapshot, job_channel, nonce_channel},
};
