use core::cell::RefCell;
use core::time::Duration;
use std::io;

use log::error;
use utils::error::*;

mod rt;
pub mod logger;

pub use rt::exec;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new(),
		})
	};
}

/// Per-fd bookkeeping for dynamic `POLLOUT` interest. Several callers can share
/// one `Io` (e.g. a server's peer sessions all writing to one shared stdout), so
/// interest is reference-counted rather than a single latch: `events` only drops
/// `POLLOUT` once every raiser has lowered it again.
#[derive(Default)]
struct Entry {
	want_write: usize,
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("socket is registered")
	}

	/// Whether any file descriptor is currently registered.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the registered descriptors once. Never blocks longer than `timeout`;
	/// `None` blocks until something is ready. Readiness itself is only used to
	/// wake `poll` early — callers still retry their own non-blocking reads/writes
	/// on `WouldBlock` rather than being told which fd is ready.
	fn poll(&mut self, timeout: Option<Duration>) -> Result {
		if self.fds.is_empty() {
			return Ok(());
		}

		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(());
		}

		for slot in self.fds.iter_mut() {
			let Poll { revents, .. } = slot;

			if *revents & POLLERR != 0 {
				panic!("socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("socket hangup while polling");
			}

			if *revents & POLLNVAL != 0 {
				panic!("invalid socket while polling");
			}

			*revents = 0;
		}

		Ok(())
	}
}

/// Poll every registered descriptor once, blocking for at most `timeout` (or
/// indefinitely, if `None`).
pub fn poll(timeout: Option<Duration>) -> Result {
	State::with(|s| s.poll(timeout))
}

/// Whether there is at least one descriptor registered, i.e. whether `poll` has
/// anything to wait on.
pub fn is_io() -> bool {
	State::with(State::is_io)
}

/// A non-blocking file descriptor registered with the poller.
///
/// Only `POLLIN` is registered by default — a socket or stdout is writable
/// essentially all the time, so raising `POLLOUT` unconditionally would make
/// every `poll` return immediately and defeat the `timeout` passed to it.
/// Callers that buffer output and hit `WouldBlock` raise write interest with
/// [`Io::raise_write_interest`] until their queue drains, matching the point of
/// registering the fd at all: waking `poll` early when it's actually worth
/// retrying. `Io` has no opinion on the shape of the I/O performed once a
/// descriptor is ready; callers still use `T`'s own non-blocking
/// read/write/recv/send, retrying on `WouldBlock`.
pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T) -> Self {
		State::with(|s| {
			s.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			s.entries.push(Entry::default());
		});

		Self { inner }
	}

	pub fn get(&self) -> &T {
		&self.inner
	}

	pub fn get_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	/// Registers interest in this descriptor becoming writable. Reference-counted:
	/// pair every call with [`Io::lower_write_interest`] once the caller's own
	/// write queue has drained.
	pub fn raise_write_interest(&self) {
		State::with(|s| {
			let idx = s.idx_of(&self.inner);
			s.entries[idx].want_write += 1;
			s.fds[idx].events |= POLLOUT;
		});
	}

	/// Releases one previously-raised interest in this descriptor becoming
	/// writable. `POLLOUT` is only dropped from the poll set once every raiser has
	/// released theirs.
	pub fn lower_write_interest(&self) {
		State::with(|s| {
			let idx = s.idx_of(&self.inner);
			let entry = &mut s.entries[idx];
			entry.want_write = entry.want_write.saturating_sub(1);

			if entry.want_write == 0 {
				s.fds[idx].events &= !POLLOUT;
			}
		});
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|s| {
			let idx = s.idx_of(&self.inner);
			s.entries.swap_remove(idx);
			s.fds.swap_remove(idx);
		})
	}
}
