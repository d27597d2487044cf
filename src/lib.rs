#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod amd64;
pub mod core;
pub mod guesser;
pub mod storage;
pub mod walker;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::core::types::{Address, Guess, GuessResult, RegisterSnapshot};
pub use crate::guesser::{CurrentFrameGuesser, DEFAULT_SEARCH_BYTES};
