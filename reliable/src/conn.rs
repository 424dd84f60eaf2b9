//! The connection collaborator (§4.4, §6): the non-blocking input/output/datagram
//! surface the session state machine drives. `Conn` is deliberately thin — the
//! actual non-blocking plumbing (poll registration, readiness latches) lives in
//! the workspace's `runtime` crate; these adapters just wire stdin/stdout/a UDP
//! socket to it.

use utils::error::*;

use crate::packet::MAX_PAYLOAD;

/// The outcome of a single non-blocking read attempt from the local input
/// source.
pub enum Input {
	/// `n` bytes were read into the caller's buffer, `n > 0`.
	Data(usize),
	/// Nothing is available right now.
	WouldBlock,
	/// The input source is exhausted.
	Eof,
}

/// The connection collaborator contract a session drives. `destroy` is expressed
/// as `Drop` on the concrete adapter, matching `runtime::Io`'s own pattern, rather
/// than an explicit method here.
pub trait Conn {
	/// Reads up to `buf.len()` bytes, at most [`MAX_PAYLOAD`].
	fn input(&mut self, buf: &mut [u8]) -> Result<Input>;

	/// Free bytes currently available in the downstream output sink.
	fn bufspace(&mut self) -> usize;

	/// Writes `buf` to the output sink. `buf.len() <= bufspace()` is required.
	fn output(&mut self, buf: &[u8]) -> Result;

	/// Best-effort, non-blocking send of a complete framed datagram.
	fn send_datagram(&mut self, frame: &[u8]) -> Result;
}

/// Concrete adapters backed by a real UDP socket and stdin/stdout. Non-blocking
/// stdio is set up via `fcntl`, so this is unix-only; the server/client binaries
/// only construct these behind `#[cfg(unix)]`.
#[cfg(unix)]
mod unix {
	use std::cell::RefCell;
	use std::io;
	use std::net::{SocketAddr, UdpSocket};
	use std::rc::Rc;

	use log::error;
	use runtime::{AsRawFd, Io};
	use utils::error::*;

	use super::Input;

	/// How many bytes of output this process is willing to buffer locally, ahead
	/// of the underlying sink, before `bufspace` reports zero.
	const OUTPUT_CAPACITY: usize = 4096;

	fn set_nonblocking(fd: i32) -> io::Result<()> {
		let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };

		if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
			return Err(io::Error::last_os_error());
		}

		Ok(())
	}

	fn read_result(result: io::Result<usize>) -> Result<Input> {
		match result {
			Ok(0) => Ok(Input::Eof),
			Ok(n) => Ok(Input::Data(n)),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Input::WouldBlock),
			Err(e) => Err(error!("input read failed: {e}")),
		}
	}

	/// Local staging buffer in front of a non-blocking output sink, draining
	/// opportunistically. Mirrors the outbound-datagram queue the workspace's
	/// `runtime::Io` already keeps, applied here to a byte stream instead of whole
	/// datagrams.
	struct OutputSink {
		io: Rc<RefCell<Io<io::Stdout>>>,
		pending: Vec<u8>,
	}

	impl OutputSink {
		fn new(io: Rc<RefCell<Io<io::Stdout>>>) -> Self {
			Self { io, pending: Vec::new() }
		}

		fn drain(&mut self) -> Result {
			if self.pending.is_empty() {
				return Ok(());
			}

			// Written as a block assigned to `result` rather than matching the write
			// call directly: a `match` scrutinee's temporaries live for the whole
			// match, which would hold this `borrow_mut` through the arm below that
			// itself needs to `borrow` the same `RefCell`.
			let result = io::Write::write(self.io.borrow_mut().get_mut(), &self.pending);

			match result {
				Ok(n) => {
					self.pending.drain(..n);

					// Only reached from a non-empty queue (checked above), so this pairs
					// with exactly the one `raise_write_interest` that queued it in `output`.
					if self.pending.is_empty() {
						self.io.borrow().lower_write_interest();
					}

					Ok(())
				}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
				Err(e) => Err(error!("output write failed: {e}")),
			}
		}

		fn bufspace(&mut self) -> usize {
			if self.drain().is_err() {
				return 0;
			}

			OUTPUT_CAPACITY.saturating_sub(self.pending.len())
		}

		fn output(&mut self, buf: &[u8]) -> Result {
			assert!(buf.len() <= OUTPUT_CAPACITY.saturating_sub(self.pending.len()));

			let was_empty = self.pending.is_empty();
			self.pending.extend_from_slice(buf);

			if was_empty && !self.pending.is_empty() {
				self.io.borrow().raise_write_interest();
			}

			self.drain()
		}
	}

	impl Drop for OutputSink {
		// A non-empty queue here means its `raise_write_interest` was never paired
		// with a `lower_write_interest` in `drain`.
		fn drop(&mut self) {
			if !self.pending.is_empty() {
				self.io.borrow().lower_write_interest();
			}
		}
	}

	/// A single-peer connection: a connected UDP socket plus the process's own
	/// stdin/stdout. Used by the client and by a server run with
	/// `single_connection`.
	pub struct StdioConn {
		socket: Rc<Io<UdpSocket>>,
		stdin: Io<io::Stdin>,
		stdout: OutputSink,
	}

	impl StdioConn {
		pub fn new(socket: Rc<Io<UdpSocket>>) -> io::Result<Self> {
			let stdin = io::stdin();
			set_nonblocking(stdin.as_raw_fd())?;

			let stdout = io::stdout();
			set_nonblocking(stdout.as_raw_fd())?;

			Ok(Self {
				socket,
				stdin: Io::new(stdin),
				stdout: OutputSink::new(Rc::new(RefCell::new(Io::new(stdout)))),
			})
		}

		pub fn socket(&self) -> &Rc<Io<UdpSocket>> {
			&self.socket
		}
	}

	impl super::Conn for StdioConn {
		fn input(&mut self, buf: &mut [u8]) -> Result<Input> {
			read_result(io::Read::read(self.stdin.get_mut(), buf))
		}

		fn bufspace(&mut self) -> usize {
			self.stdout.bufspace()
		}

		fn output(&mut self, buf: &[u8]) -> Result {
			self.stdout.output(buf)
		}

		fn send_datagram(&mut self, frame: &[u8]) -> Result {
			match self.socket.get().send(frame) {
				Ok(_) => Ok(()),
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
				Err(e) => Err(error!("datagram send failed: {e}")),
			}
		}
	}

	/// A per-peer connection on a server: a shared, unconnected UDP socket plus a
	/// fixed peer address, and a shared stdout. `send_datagram` uses `send_to`
	/// rather than `send`.
	pub struct PeerConn {
		socket: Rc<Io<UdpSocket>>,
		peer: SocketAddr,
		input_done: bool,
		stdout: OutputSink,
	}

	impl PeerConn {
		pub fn new(socket: Rc<Io<UdpSocket>>, peer: SocketAddr, stdout: Rc<RefCell<Io<io::Stdout>>>) -> Self {
			Self {
				socket,
				peer,
				input_done: false,
				stdout: OutputSink::new(stdout),
			}
		}
	}

	/// A single nonblocking stdout handle, shared across every [`PeerConn`] a
	/// server spawns — all peers interleave onto the one process stdout.
	pub fn shared_stdout() -> io::Result<Rc<RefCell<Io<io::Stdout>>>> {
		let stdout = io::stdout();
		set_nonblocking(stdout.as_raw_fd())?;
		Ok(Rc::new(RefCell::new(Io::new(stdout))))
	}

	impl super::Conn for PeerConn {
		fn input(&mut self, _buf: &mut [u8]) -> Result<Input> {
			// A server-side peer session has no local input of its own to read; it
			// only ever relays what arrives over the socket. Report EOF once, so the
			// session never tries to originate new data frames.
			if self.input_done {
				return Ok(Input::WouldBlock);
			}

			self.input_done = true;
			Ok(Input::Eof)
		}

		fn bufspace(&mut self) -> usize {
			self.stdout.bufspace()
		}

		fn output(&mut self, buf: &[u8]) -> Result {
			self.stdout.output(buf)
		}

		fn send_datagram(&mut self, frame: &[u8]) -> Result {
			match self.socket.get().send_to(frame, self.peer) {
				Ok(_) => Ok(()),
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
				Err(e) => Err(error!("datagram send to {} failed: {e}", self.peer)),
			}
		}
	}
}

#[cfg(unix)]
pub use unix::{shared_stdout, PeerConn, StdioConn};

#[cfg(test)]
pub mod test_double {
	//! An in-memory [`Conn`] used by the session integration tests — no real
	//! socket or file descriptor involved.

	use std::collections::VecDeque;

	use super::*;

	#[derive(Default)]
	pub struct FakeConn {
		pub input: VecDeque<u8>,
		pub input_eof: bool,
		pub output: Vec<u8>,
		pub bufspace: usize,
		pub datagrams: Vec<Vec<u8>>,
	}

	impl FakeConn {
		pub fn with_bufspace(bufspace: usize) -> Self {
			Self { bufspace, ..Default::default() }
		}

		pub fn feed(&mut self, bytes: &[u8]) {
			self.input.extend(bytes);
		}
	}

	impl Conn for FakeConn {
		fn input(&mut self, buf: &mut [u8]) -> Result<Input> {
			if self.input.is_empty() {
				return Ok(if self.input_eof { Input::Eof } else { Input::WouldBlock });
			}

			let n = buf.len().min(self.input.len()).min(MAX_PAYLOAD);

			for slot in buf.iter_mut().take(n) {
				*slot = self.input.pop_front().expect("checked non-empty above");
			}

			Ok(Input::Data(n))
		}

		fn bufspace(&mut self) -> usize {
			self.bufspace
		}

		fn output(&mut self, buf: &[u8]) -> Result {
			assert!(buf.len() <= self.bufspace);
			self.output.extend_from_slice(buf);
			self.bufspace -= buf.len();
			Ok(())
		}

		fn send_datagram(&mut self, frame: &[u8]) -> Result {
			self.datagrams.push(frame.to_vec());
			Ok(())
		}
	}
}
