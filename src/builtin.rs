use std::env;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd;
use thiserror::Error;
use tracing::debug;

use crate::types::Word;

#[derive(Debug, Error)]
pub enum CdError {
	#[error("usage: cd [ destdir ]")]
	Usage,
	#[error("cd: HOME not set")]
	NoHome,
	#[error("{path}: {source}")]
	Chdir { path: String, source: Errno },
}

/// Commands run inside the interpreter instead of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
	ChangeDir,
}

impl Builtin {
	pub fn name(self) -> &'static str {
		match self {
			Builtin::ChangeDir => "cd",
		}
	}

	pub fn run(self, arguments: &[Word]) -> Result<(), CdError> {
		match self {
			Builtin::ChangeDir => builtin_cd(arguments),
		}
	}
}

fn home() -> Result<PathBuf, CdError> {
	env::var_os("HOME").map(PathBuf::from).ok_or(CdError::NoHome)
}

pub fn builtin_cd(arguments: &[Word]) -> Result<(), CdError> {
	let target = match arguments {
		[] => home()?,
		[dir] if &dir[..] == b"~" => home()?,
		[dir] => PathBuf::from(OsStr::from_bytes(dir)),
		_ => { return Err(CdError::Usage); },
	};
	debug!(target = %target.display(), "cd");
	unistd::chdir(target.as_path()).map_err(|e| CdError::Chdir { path: target.display().to_string(), source: e })
}

pub fn match_builtin(name: &[u8]) -> Option<Builtin> {
	match name {
		b"cd" => Some(Builtin::ChangeDir),
		_ => None,
	}
}
