//! Wire framing: parsing and serializing the protocol's packet format (§3).
//!
//! All multi-byte integer fields are network byte order; the checksum is the
//! RFC 1071 internet checksum of the frame with the cksum field zeroed.

use utils::bytes::{self, Cast};
use utils::endian::{u16be, u32be};

use crate::checksum::Checksum;

/// Largest payload a single data frame may carry.
pub const MAX_PAYLOAD: usize = 500;
/// Wire length of a pure ack (no seqno, no payload).
pub const ACK_LEN: usize = 8;
/// Wire length of a data/EOF frame header, before the payload.
pub const DATA_HEADER_LEN: usize = 12;
/// Largest a frame may be, header included.
pub const MAX_LEN: usize = DATA_HEADER_LEN + MAX_PAYLOAD;

/// Common prefix shared by every frame shape: enough to read `ackno` and validate
/// `len`/checksum before knowing whether a seqno follows.
#[derive(Cast)]
#[repr(C)]
struct AckHeader {
	cksum: [u8; 2],
	len: u16be,
	ackno: u32be,
}

#[derive(Cast)]
#[repr(C)]
struct DataHeader {
	cksum: [u8; 2],
	len: u16be,
	ackno: u32be,
	seqno: u32be,
}

/// A data or end-of-stream frame, host-order and ergonomic for the state machine
/// to work with. An EOF frame is one with an empty `payload`. Pure acks are not
/// represented by this type — see [`write_ack`] and [`Frame::Ack`].
pub struct Packet {
	pub ackno: u32,
	pub seqno: u32,
	pub payload: Vec<u8>,
}

/// The result of parsing a validated datagram: either a pure ack or a data/EOF
/// frame.
pub enum Frame {
	Ack { ackno: u32 },
	Data(Packet),
}

impl Packet {
	/// Serializes this frame to the wire, computing the checksum last over the
	/// fully populated buffer.
	pub fn write(&self) -> Vec<u8> {
		assert!(self.payload.len() <= MAX_PAYLOAD);

		let len = DATA_HEADER_LEN + self.payload.len();
		let mut buf = vec![0u8; len];

		{
			let header: &mut DataHeader = bytes::cast_mut(&mut buf[..DATA_HEADER_LEN]);
			header.len = (len as u16).into();
			header.ackno = self.ackno.into();
			header.seqno = self.seqno.into();
		}

		buf[DATA_HEADER_LEN..].copy_from_slice(&self.payload);

		let cksum = Checksum::of(&buf).end();
		bytes::cast_mut::<DataHeader, _>(&mut buf[..DATA_HEADER_LEN]).cksum = cksum;

		buf
	}
}

/// Serializes a pure ack frame (len = 8, no seqno, no payload).
pub fn write_ack(ackno: u32) -> [u8; ACK_LEN] {
	let mut buf = [0u8; ACK_LEN];

	{
		let header: &mut AckHeader = bytes::cast_mut(&mut buf);
		header.len = (ACK_LEN as u16).into();
		header.ackno = ackno.into();
	}

	let cksum = Checksum::of(&buf).end();
	bytes::cast_mut::<AckHeader, _>(&mut buf).cksum = cksum;

	buf
}

/// Validates and parses a received datagram. Returns `None` for anything
/// malformed: too short, a truncated or oversized `len`, or a checksum mismatch —
/// these are dropped silently by the caller (§7).
pub fn parse(buf: &[u8]) -> Option<Frame> {
	let n = buf.len();

	if n < ACK_LEN {
		return None;
	}

	let header: &AckHeader = bytes::cast(&buf[..ACK_LEN]);
	let len = header.len.get() as usize;

	if len > n || len > MAX_LEN || (len != ACK_LEN && len < DATA_HEADER_LEN) {
		return None;
	}

	let frame = &buf[..len];
	let cksum = header.cksum;
	let ackno = header.ackno.get();

	let mut zeroed = frame.to_vec();
	zeroed[0..2].fill(0);

	if Checksum::of(&zeroed).end() != cksum {
		return None;
	}

	if len == ACK_LEN {
		return Some(Frame::Ack { ackno });
	}

	let data: &DataHeader = bytes::cast(&frame[..DATA_HEADER_LEN]);

	Some(Frame::Data(Packet {
		ackno,
		seqno: data.seqno.get(),
		payload: frame[DATA_HEADER_LEN..].to_vec(),
	}))
}
