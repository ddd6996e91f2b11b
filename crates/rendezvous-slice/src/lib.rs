#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod config;
mod keys;
mod recv;
mod send;
pub mod slicing;

pub use config::*;
pub use keys::*;
pub use recv::*;
pub use send::*;
