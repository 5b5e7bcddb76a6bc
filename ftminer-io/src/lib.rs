mod bus;
mod config;
mod controller;
pub mod devices;
mod error;
pub mod ft232r;
pub mod jtag;
mod pins;
mod pipeline;
pub mod sim;
mod transport;
pub mod units;
mod utils;

pub use crate::{
    bus::{Bus, Link, Session},
    config::Config,
    controller::{Controller, Device, Phase, Progress, Topology, compose_ir, ir_field},
    error::{Error, Fault, Result},
    pins::{Chain, ChainPins, PinAssignment, Pins, Select},
    pipeline::{BULK_BYTES_PER_BIT, BYTES_PER_CLOCK, Emitter, WriteBuffer, encode_bulk},
    transport::{Mode, Transport},
    utils::{BitStr, Hex, SpaceHex, bits_to_u64, u64_to_bits},
};
