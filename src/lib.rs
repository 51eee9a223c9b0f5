//! WHATWG-style readable, writable and transform streams over
//! reference-counted byte chunks.
//!
//! Every stream is driven by one future that owns its source or sink. The
//! host decides where that future runs by handing a spawn function to the
//! stream's builder.

pub mod platform;
pub mod streams;

pub use streams::*;
