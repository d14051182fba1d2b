//! Network transport primitives.
//!
//! Addresses plus the TCP / Unix stream sockets the dispatcher drives
//! through mio.

pub mod address;
pub(crate) mod stream;

pub use address::{Address, AddressError};
