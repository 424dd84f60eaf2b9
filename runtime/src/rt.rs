use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use utils::error::Result;

use crate::{is_io, poll};

static EXIT: AtomicBool = AtomicBool::new(false);

/// Drives the poll loop until Ctrl+C is pressed or there is no more I/O left to
/// wait on.
///
/// `tick` runs once after every `poll`, including the very first one (with a zero
/// timeout, so an empty session set still gets a chance to do initial work); it
/// returns how long the next `poll` should be allowed to block for. Returning
/// `None` blocks indefinitely, which is only correct once at least one descriptor
/// has readiness or timer work pending somewhere else.
pub fn exec(mut tick: impl FnMut() -> Option<Duration>) -> Result {
	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed)).map_err(|err| log::error!("failed to install Ctrl+C handler: {err}"))?;

	let mut timeout = Some(Duration::ZERO);

	loop {
		if EXIT.load(Ordering::Relaxed) {
			break;
		}

		if timeout.is_none() && !is_io() {
			break;
		}

		poll(timeout)?;

		timeout = tick();
	}

	Ok(())
}
