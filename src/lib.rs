#![deny(rust_2018_idioms)]

extern crate self as libbit;

#[macro_use]
extern crate log;

#[macro_use]
extern crate bitflags;

#[cfg(test)]
extern crate quickcheck;

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

pub mod delta;
pub mod env;
pub mod error;
pub mod hash;
pub mod mmap;
pub mod obj;
pub mod odb;
pub mod pack;
pub mod serialize;
pub mod signature;
pub mod zlib;

mod io;
mod lockfile;

pub use error::{BitError, BitResult};
