use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd;
use tracing::trace;

/// One link between two adjacent stages.
///
/// Both ends are close-on-exec, so a child only keeps the end it duplicated onto a
/// standard stream.
#[derive(Debug)]
pub struct Channel {
	pub read: OwnedFd,
	pub write: OwnedFd,
}

impl Channel {
	pub fn open() -> nix::Result<Channel> {
		let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
		trace!(read = read.as_raw_fd(), write = write.as_raw_fd(), "channel opened");
		Ok(Channel { read: read, write: write })
	}

	/// Parent side, once the writing stage has been spawned: the write end is retired
	/// and the read end is handed on to the next stage.
	pub fn into_reader(self) -> nix::Result<OwnedFd> {
		close(self.write)?;
		Ok(self.read)
	}
}

/// Closes a descriptor, surfacing the error `OwnedFd`'s drop would swallow.
pub fn close(fd: OwnedFd) -> nix::Result<()> {
	let raw: RawFd = fd.into_raw_fd();
	trace!(fd = raw, "close");
	unistd::close(raw)
}
