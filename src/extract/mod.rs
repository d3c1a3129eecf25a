//! Per-record measurement: locate two timestamps in a JSON payload and
//! turn their difference into a signed duration.

pub mod delta;
pub mod pointer;

pub use delta::{Clock, DeltaExtractor, FixedClock, SystemClock};
pub use pointer::{parse_timestamp, resolve};
