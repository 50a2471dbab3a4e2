//! Wire formats for the shaper crates.
//!
//! Every unit of traffic between two peers carries a small control header in
//! front of its payload. The header is how the receive side hands out
//! bandwidth allocations and how the send side asks for more, piggybacked on
//! data traffic instead of a separate round trip.

pub mod control;
