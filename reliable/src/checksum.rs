//! An implementation of [RFC 1071]'s internet checksum.
//!
//! [RFC 1071]: https://datatracker.ietf.org/doc/html/rfc1071

#[derive(Clone, Default)]
pub struct Checksum {
	acc: u64,
}

impl Checksum {
	/// Create a new checksum calculation state.
	#[inline]
	pub fn of(buffer: &[u8]) -> Self {
		let mut csum = Self::default();
		csum.push(buffer);
		csum
	}

	/// Add bytes to the checksum calculation.
	#[inline]
	pub fn push(&mut self, buffer: &[u8]) {
		let (chunks, rem) = buffer.as_chunks();

		for word in chunks {
			self.push_chunk(word);
		}

		if !rem.is_empty() {
			let mut buf = [0; 4];
			buf[..rem.len()].copy_from_slice(rem);
			self.push_chunk(&buf);
		}
	}

	/// Adds a single word to the checksum calculation.
	#[inline]
	pub fn push_chunk(&mut self, word: &[u8; 4]) {
		self.acc += u32::from_ne_bytes(*word) as u64;
	}

	/// Finalize checksum calculation and return its byte representation, consuming the [`Checksum`] instance.
	#[inline]
	pub fn end(self) -> [u8; 2] {
		let acc = (self.acc >> 32) as u32 + self.acc as u32;

		let (acc, c) = (acc as u16).overflowing_add((acc >> 16) as u16);
		let acc = acc + c as u16;

		(!acc).to_ne_bytes()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn all_zero_buffer() {
		assert_eq!(Checksum::of(&[0; 16]).end(), [0xff, 0xff]);
	}

	#[test]
	fn odd_length_buffer() {
		// An odd trailing byte is padded with a zero byte before being folded in.
		let a = Checksum::of(&[1, 2, 3]).end();
		let b = Checksum::of(&[1, 2, 3, 0]).end();

		assert_eq!(a, b);
	}

	#[test]
	fn carry_propagation() {
		// Two words that overflow a u16 sum must have their carry folded back in.
		let csum = Checksum::of(&[0xff, 0xff, 0xff, 0xff]).end();

		assert_eq!(csum, [0, 0]);
	}

	#[test]
	fn zeroed_field_round_trips() {
		// Frames here are checksummed with the cksum field zeroed, then the result is
		// stored in that field. Re-zeroing and recomputing must reproduce it.
		let mut frame = vec![0u8; 12];
		frame[4..8].copy_from_slice(&0xdead_beefu32.to_be_bytes());

		let sum = Checksum::of(&frame).end();
		frame[0..2].copy_from_slice(&sum);

		let mut rezeroed = frame.clone();
		rezeroed[0..2].fill(0);

		assert_eq!(Checksum::of(&rezeroed).end(), sum);
	}
}
