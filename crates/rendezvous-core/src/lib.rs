#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod args;
mod array;
mod cancel;
mod error;
mod key;
mod local;
mod table;

pub use args::*;
pub use array::*;
pub use cancel::*;
pub use error::*;
pub use key::*;
pub use local::*;
pub use table::*;
