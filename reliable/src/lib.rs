#![feature(slice_as_chunks)]

//! A reliable, in-order, bidirectional byte-stream protocol layered over an
//! unreliable datagram substrate: sliding-window flow control, cumulative
//! acknowledgment, retransmission on timeout, checksummed framing, small-packet
//! coalescing, and a symmetric half-close teardown.

pub mod checksum;
pub mod conn;
pub mod packet;
pub mod registry;
pub mod session;
pub mod wsb;
