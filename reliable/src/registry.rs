//! The Session Registry (§4.3): the set of live sessions a server keeps, keyed
//! by peer address for demultiplexing incoming datagrams and enumerable for the
//! periodic timer tick.
//!
//! Sessions do not reference each other — this is an owning `HashMap`, not the
//! source's intrusive linked list (§9, Design Notes).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use log::debug;

use crate::conn::Conn;
use crate::packet::{self, Frame};
use crate::session::Session;

/// Keeps every live session for a listening server, and enforces the
/// no-mid-flow-entry rule: a datagram from an unknown peer only opens a new
/// session if it is a seqno-1 data frame.
pub struct Registry<C: Conn> {
	sessions: HashMap<SocketAddr, Session<C>>,
	window: u32,
	timeout: std::time::Duration,
}

impl<C: Conn> Registry<C> {
	pub fn new(window: u32, timeout: std::time::Duration) -> Self {
		Registry { sessions: HashMap::new(), window, timeout }
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	/// Dispatches a datagram from `addr` to its session, creating one first if
	/// `addr` is unseen and the datagram is a fresh (seqno 1) data frame. Drops
	/// anything else from an unknown peer. `make_conn` is only invoked when a
	/// session is actually created.
	pub fn on_datagram(&mut self, addr: SocketAddr, buf: &[u8], make_conn: impl FnOnce() -> C) {
		if let Some(session) = self.sessions.get_mut(&addr) {
			if session.on_packet(buf) {
				self.sessions.remove(&addr);
			}

			return;
		}

		match packet::parse(buf) {
			Some(Frame::Data(pkt)) if pkt.seqno == 1 => {
				let mut session = Session::new(make_conn(), self.window, self.timeout);

				if !session.on_packet(buf) {
					self.sessions.insert(addr, session);
				}
			}
			_ => debug!("dropping datagram from unknown peer {addr}: not a session-opening frame"),
		}
	}

	/// Drives the input-readable and output-writable events for every live
	/// session. The server's own process has no local input of its own to feed
	/// in (its peer sessions only relay what arrives over the wire, per
	/// [`crate::conn::PeerConn`]), but output delivery still needs a periodic
	/// nudge for sessions whose downstream sink was previously full.
	pub fn drive_io(&mut self) {
		let mut dead = Vec::new();

		for (addr, session) in self.sessions.iter_mut() {
			if session.on_input_readable() || session.on_output_writable() {
				dead.push(*addr);
			}
		}

		for addr in dead {
			self.sessions.remove(&addr);
		}
	}

	/// §4.2.4: the periodic timer tick, fanned out to every live session.
	pub fn tick(&mut self, now: Instant) {
		let mut dead = Vec::new();

		for (addr, session) in self.sessions.iter_mut() {
			if session.on_timer(now) {
				dead.push(*addr);
			}
		}

		for addr in dead {
			self.sessions.remove(&addr);
		}
	}
}
