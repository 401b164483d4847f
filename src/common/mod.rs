//! Core shared types

mod address;

pub use address::Address;

pub use crate::error::{Error, Result};
