#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

mod error;
mod id;
mod meta;
mod params;
mod record;
pub mod request;
pub mod server;
mod socket;

pub use crate::{
    error::*,
    meta::{ProtocolStatus, RecordType, Role},
    request::Request,
    server::Server,
};
