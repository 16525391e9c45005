//! SIGINT handling. The handler only raises a flag; everything else reads the flag.
//!
//! The flag is set by the handler, cleared at the top of every read-eval cycle, and
//! consulted when a read or a wait comes back with EINTR.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::trace;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
	INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT handler. No SA_RESTART, so blocking reads and waits return EINTR.
pub fn install() -> nix::Result<()> {
	let action = SigAction::new(SigHandler::Handler(on_sigint), SaFlags::empty(), SigSet::empty());
	unsafe { signal::sigaction(Signal::SIGINT, &action) }?;
	trace!("SIGINT handler installed");
	Ok(())
}

/// Puts SIGINT and SIGPIPE back to their default dispositions. Used in a child before it
/// is unblocked; the Rust runtime ignores SIGPIPE and an ignored signal survives exec.
pub fn restore_default() -> nix::Result<()> {
	let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
	for sig in &[Signal::SIGINT, Signal::SIGPIPE] {
		unsafe { signal::sigaction(*sig, &action) }?;
	}
	Ok(())
}

pub fn interrupted() -> bool {
	INTERRUPTED.load(Ordering::SeqCst)
}

pub fn clear() {
	INTERRUPTED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
pub fn interrupt_for_test() {
	INTERRUPTED.store(true, Ordering::SeqCst);
}

fn sigint_set() -> SigSet {
	let mut set = SigSet::empty();
	set.add(Signal::SIGINT);
	set
}

pub fn block() -> nix::Result<()> {
	sigint_set().thread_block()
}

pub fn unblock() -> nix::Result<()> {
	sigint_set().thread_unblock()
}

/// Keeps SIGINT blocked while alive. A signal arriving meanwhile stays pending and is
/// delivered when the guard goes away.
pub struct SigintBlock {
	_private: (),
}

impl SigintBlock {
	pub fn new() -> nix::Result<SigintBlock> {
		block()?;
		Ok(SigintBlock { _private: () })
	}

	/// Unblocks now, reporting failure instead of swallowing it in `drop`.
	pub fn release(self) -> nix::Result<()> {
		std::mem::forget(self);
		unblock()
	}
}

impl Drop for SigintBlock {
	fn drop(&mut self) {
		let _ = unblock();
	}
}
