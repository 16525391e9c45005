use std::convert::Infallible;
use std::ffi::{self, CString};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use thiserror::Error;

use crate::channel::Channel;
use crate::signals;
use crate::types::Stage;

#[derive(Debug, Error)]
pub enum LaunchError {
	#[error("{path}: {}", .source.desc())]
	Open { path: String, source: Errno },
	#[error("dup2 {what}: {source}")]
	Rewire { what: &'static str, source: Errno },
	#[error("close {what}: {source}")]
	Close { what: &'static str, source: Errno },
	#[error("sigprocmask: {0}")]
	Signal(Errno),
	#[error("{program}: {}", .source.desc())]
	Exec { program: String, source: Errno },
}

fn lossy(bytes: &[u8]) -> String {
	String::from_utf8_lossy(bytes).into_owned()
}

/// Everything a child needs, converted before the fork so the child does not allocate
/// on the success path.
#[derive(Debug)]
pub struct Launch<'p> {
	program: CString,
	argv: Vec<CString>,
	input: Option<&'p [u8]>,
	output: Option<&'p [u8]>,
}

impl<'p> Launch<'p> {
	pub fn prepare(stage: &'p Stage) -> Result<Launch<'p>, ffi::NulError> {
		let argv: Result<Vec<CString>, ffi::NulError> = stage.argv.iter().map(|w| CString::new(w.to_vec())).collect();
		let argv = argv?;
		Ok(Launch {
			program: argv[0].clone(),
			argv: argv,
			input: stage.input.as_deref(),
			output: stage.output.as_deref(),
		})
	}

	pub fn program(&self) -> String {
		self.program.to_string_lossy().into_owned()
	}

	/// Wires the standard streams of the current (child) process and replaces its image.
	/// Only returns on failure.
	///
	/// Channel ends go first: when the interpreter started with a standard stream closed,
	/// a channel end may sit on descriptor 0 or 1 and must be moved before a redirection
	/// can take that slot.
	fn exec(&self, prior: Option<&OwnedFd>, next: Option<&Channel>) -> Result<Infallible, LaunchError> {
		if let Some(read) = prior {
			rewire(read.as_raw_fd(), libc::STDIN_FILENO, "previous channel")?;
		}
		if let Some(next) = next {
			close(next.read.as_raw_fd(), "next channel")?;
			rewire(next.write.as_raw_fd(), libc::STDOUT_FILENO, "next channel")?;
		}

		if let Some(path) = self.input {
			let fd = fcntl::open(path, OFlag::O_RDONLY, Mode::empty())
				.map_err(|e| LaunchError::Open { path: lossy(path), source: e })?;
			rewire(fd, libc::STDIN_FILENO, "input redirection")?;
		}
		if let Some(path) = self.output {
			let perms = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH;
			let fd = fcntl::open(path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC, perms)
				.map_err(|e| LaunchError::Open { path: lossy(path), source: e })?;
			rewire(fd, libc::STDOUT_FILENO, "output redirection")?;
		}

		signals::restore_default().map_err(LaunchError::Signal)?;
		signals::unblock().map_err(LaunchError::Signal)?;
		unistd::execvp(&self.program, &self.argv)
			.map_err(|e| LaunchError::Exec { program: self.program(), source: e })
	}
}

fn dup(fd: RawFd, target: RawFd, what: &'static str) -> Result<(), LaunchError> {
	unistd::dup2(fd, target).map_err(|e| LaunchError::Rewire { what: what, source: e })?;
	Ok(())
}

fn close(fd: RawFd, what: &'static str) -> Result<(), LaunchError> {
	unistd::close(fd).map_err(|e| LaunchError::Close { what: what, source: e })
}

/// Moves `fd` onto `target`. A descriptor already in place only loses its close-on-exec flag.
fn rewire(fd: RawFd, target: RawFd, what: &'static str) -> Result<(), LaunchError> {
	if fd == target {
		fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
			.map_err(|e| LaunchError::Rewire { what: what, source: e })?;
		return Ok(());
	}
	dup(fd, target, what)?;
	close(fd, what)
}

/// Body of a forked child. Never returns to the caller's shell logic.
pub fn run_child(launch: &Launch, prior: Option<&OwnedFd>, next: Option<&Channel>) -> ! {
	let err = match launch.exec(prior, next) {
		Ok(never) => match never {},
		Err(e) => e,
	};
	let _ = writeln!(&mut io::stderr(), "{}", err);
	unsafe { libc::_exit(1) }
}
