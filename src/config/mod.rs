//! Crate-wide configuration constants.

mod constants;

pub use constants::*;
