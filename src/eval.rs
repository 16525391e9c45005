use std::io::{self, Write};
use std::os::fd::OwnedFd;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::{self, Pid};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::builtin::{self, Builtin, CdError};
use crate::channel::{self, Channel};
use crate::launch::{self, Launch};
use crate::signals::{self, SigintBlock};
use crate::types::{Pipeline, Word};

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("sigprocmask: {0}")]
	Signal(Errno),
	#[error("pipe: {0}")]
	Pipe(Errno),
	#[error("fork {program}: {source}")]
	Fork { program: String, source: Errno },
	#[error("wait: {0}")]
	Wait(Errno),
	#[error("close: {0}")]
	Close(Errno),
	#[error("{0}: argument contains a nul byte")]
	Nul(String),
	#[error("{0}: must be the only command and cannot be redirected")]
	BuiltinPlacement(&'static str),
}

impl ExecError {
	/// Fatal errors mean the process environment is no longer reliable; the rest only
	/// cost the current line.
	pub fn is_fatal(&self) -> bool {
		!matches!(*self, ExecError::Nul(_) | ExecError::BuiltinPlacement(_))
	}
}

pub trait WaitStatusExt {
	fn code(self) -> i32;
}

impl WaitStatusExt for WaitStatus {
	fn code(self) -> i32 {
		match self {
			WaitStatus::Exited(_, code) => code,
			WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
			_ => -1,
		}
	}
}

/// How a pipeline will be carried out, decided before any channel exists.
#[derive(Debug)]
pub enum Plan<'p> {
	External(Vec<Launch<'p>>),
	Builtin(Builtin, &'p [Word<'p>]),
}

pub fn plan<'p>(pipeline: &'p Pipeline<'p>) -> Result<Plan<'p>, ExecError> {
	for (i, stage) in pipeline.stages.iter().enumerate() {
		if let Some(b) = builtin::match_builtin(stage.name()) {
			if i != 0 || pipeline.len() != 1 || stage.is_redirected() {
				return Err(ExecError::BuiltinPlacement(b.name()));
			}
			return Ok(Plan::Builtin(b, stage.arguments()));
		}
	}
	let mut launches = Vec::with_capacity(pipeline.len());
	for stage in &pipeline.stages {
		let launch = Launch::prepare(stage)
			.map_err(|_| ExecError::Nul(String::from_utf8_lossy(stage.name()).into_owned()))?;
		launches.push(launch);
	}
	Ok(Plan::External(launches))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
	pub pid: Pid,
	pub status: Option<WaitStatus>,
}

/// What one external run did. `children` is in stage order.
#[derive(Debug, Default)]
pub struct Report {
	pub channels: usize,
	pub children: Vec<Child>,
	pub interrupted: bool,
}

impl Report {
	pub fn spawned(&self) -> usize {
		self.children.len()
	}

	pub fn reaped(&self) -> usize {
		self.children.iter().filter(|c| c.status.is_some()).count()
	}

	/// Exit code of the last stage.
	pub fn code(&self) -> Option<i32> {
		self.children.last().and_then(|c| c.status).map(|s| s.code())
	}
}

#[derive(Debug)]
pub enum Outcome {
	Builtin(Result<(), CdError>),
	Ran(Report),
}

/// Result of one wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
	Completed(WaitStatus),
	Interrupted,
}

pub fn reap() -> Result<Reaped, ExecError> {
	match wait::wait() {
		Ok(status) => Ok(Reaped::Completed(status)),
		Err(Errno::EINTR) => Ok(Reaped::Interrupted),
		Err(e) => Err(ExecError::Wait(e)),
	}
}

/// Children must not inherit unflushed output. A failed flush is logged and spawning goes on.
fn flush_inherited<W: Write>(out: &mut W) -> bool {
	match out.flush() {
		Ok(()) => true,
		Err(e) => {
			warn!(error = %e, "flushing stdout before spawning");
			false
		},
	}
}

fn spawn_stages(launches: &[Launch], report: &mut Report) -> Result<(), ExecError> {
	let last = launches.len() - 1;
	let mut prior: Option<OwnedFd> = None;

	flush_inherited(&mut io::stdout());

	for (i, launch) in launches.iter().enumerate() {
		let next = if i < last {
			let ch = Channel::open().map_err(ExecError::Pipe)?;
			report.channels += 1;
			Some(ch)
		} else {
			None
		};

		match unsafe { unistd::fork() } {
			Ok(unistd::ForkResult::Child) => launch::run_child(launch, prior.as_ref(), next.as_ref()),
			Ok(unistd::ForkResult::Parent { child }) => {
				debug!(pid = child.as_raw(), stage = i, program = %launch.program(), "spawned");
				report.children.push(Child { pid: child, status: None });
			},
			Err(e) => { return Err(ExecError::Fork { program: launch.program(), source: e }); },
		}

		if let Some(read) = prior.take() {
			channel::close(read).map_err(ExecError::Close)?;
		}
		prior = match next {
			Some(ch) => Some(ch.into_reader().map_err(ExecError::Close)?),
			None => None,
		};
	}
	Ok(())
}

fn forward_interrupt(report: &Report) {
	for child in report.children.iter().filter(|c| c.status.is_none()) {
		trace!(pid = child.pid.as_raw(), "forwarding SIGINT");
		let _ = signal::kill(child.pid, Signal::SIGINT);
	}
}

fn reap_all(report: &mut Report) -> Result<(), ExecError> {
	let mut outstanding = report.spawned();
	while outstanding > 0 {
		match reap()? {
			Reaped::Completed(status) => {
				let pid = status.pid();
				match report.children.iter_mut().find(|c| c.status.is_none() && Some(c.pid) == pid) {
					Some(child) => {
						debug!(pid = child.pid.as_raw(), status = ?status, "reaped");
						child.status = Some(status);
						outstanding -= 1;
					},
					None => warn!(status = ?status, "reaped a process that is not part of the pipeline"),
				}
			},
			Reaped::Interrupted => {
				debug!("wait interrupted");
				report.interrupted = true;
				forward_interrupt(report);
			},
		}
	}
	Ok(())
}

fn run(launches: &[Launch]) -> Result<Report, ExecError> {
	let mut report = Report::default();
	let guard = SigintBlock::new().map_err(ExecError::Signal)?;
	spawn_stages(launches, &mut report)?;
	guard.release().map_err(ExecError::Signal)?;
	// a SIGINT held back during the spawns has just been delivered
	if signals::interrupted() {
		report.interrupted = true;
		forward_interrupt(&report);
	}
	reap_all(&mut report)?;
	Ok(report)
}

pub fn execute(pipeline: &Pipeline) -> Result<Outcome, ExecError> {
	match plan(pipeline)? {
		Plan::Builtin(b, arguments) => Ok(Outcome::Builtin(b.run(arguments))),
		Plan::External(launches) => run(&launches).map(Outcome::Ran),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{env, fs, process, thread};
	use std::path::Path;
	use std::time::Duration;
	use serial_test::serial;
	use crate::parser;

	fn run_line(line: &str) -> Result<Outcome, ExecError> {
		signals::clear();
		let pipeline = parser::parse(line.as_bytes()).unwrap();
		execute(&pipeline)
	}

	fn ran(line: &str) -> Report {
		match run_line(line).unwrap() {
			Outcome::Ran(report) => report,
			Outcome::Builtin(_) => panic!("{} ran as a builtin", line),
		}
	}

	fn read(path: &Path) -> String {
		fs::read_to_string(path).unwrap()
	}

	#[test]
	#[serial]
	fn two_stage_pipe() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out");
		let report = ran(&format!("echo hi | tr a-z A-Z > {}", out.display()));
		assert_eq!(read(&out), "HI\n");
		assert_eq!(report.channels, 1);
		assert_eq!(report.spawned(), 2);
		assert_eq!(report.reaped(), 2);
		assert_eq!(report.code(), Some(0));
		assert!(!report.interrupted);
	}

	#[test]
	#[serial]
	fn early_reader_exit_kills_the_writer_with_sigpipe() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out");
		let report = ran(&format!("yes | head -n 1 > {}", out.display()));
		assert_eq!(read(&out), "y\n");
		assert!(matches!(report.children[0].status, Some(WaitStatus::Signaled(_, Signal::SIGPIPE, _))));
		assert_eq!(report.code(), Some(0));
	}

	#[test]
	fn failed_flush_is_not_fatal() {
		struct Broken;
		impl Write for Broken {
			fn write(&mut self, _: &[u8]) -> io::Result<usize> {
				Err(io::Error::from(io::ErrorKind::BrokenPipe))
			}
			fn flush(&mut self) -> io::Result<()> {
				Err(io::Error::from(io::ErrorKind::BrokenPipe))
			}
		}
		assert!(!flush_inherited(&mut Broken));
		assert!(flush_inherited(&mut Vec::new()));
	}

	#[test]
	#[serial]
	fn single_stage_uses_no_channel() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out");
		let report = ran(&format!("echo alone > {}", out.display()));
		assert_eq!(report.channels, 0);
		assert_eq!(report.reaped(), 1);
		assert_eq!(read(&out), "alone\n");
	}

	#[test]
	#[serial]
	fn matches_the_system_shell() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out");
		let stages = "printf \"pear\\napple\\npear\\nfig\\n\" | sort | uniq -c | sort -r";
		let report = ran(&format!("{} > {}", stages, out.display()));
		assert_eq!(report.channels, 3);
		assert_eq!(report.reaped(), 4);
		let reference = process::Command::new("sh").arg("-c").arg(stages).output().unwrap();
		assert_eq!(read(&out), String::from_utf8(reference.stdout).unwrap());
	}

	#[test]
	#[serial]
	fn input_redirection_feeds_the_first_stage() {
		let dir = tempfile::tempdir().unwrap();
		let input = dir.path().join("in");
		let out = dir.path().join("out");
		fs::write(&input, "one\ntwo\nthree\n").unwrap();
		ran(&format!("cat < {} | wc -l > {}", input.display(), out.display()));
		assert_eq!(read(&out).trim(), "3");
	}

	#[cfg(target_os = "linux")]
	#[test]
	#[serial]
	fn no_descriptor_outlives_the_run() {
		fn open_fds() -> usize {
			fs::read_dir("/proc/self/fd").unwrap().count()
		}
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out");
		let line = format!("echo abc | cat | cat | cat | wc -c > {}", out.display());
		let before = open_fds();
		let report = ran(&line);
		assert_eq!(open_fds(), before);
		assert_eq!(report.channels, 4);
		assert_eq!(report.reaped(), 5);
		assert_eq!(read(&out).trim(), "4");
	}

	#[test]
	#[serial]
	fn failed_input_leaves_an_empty_truncated_output() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out.txt");
		fs::write(&out, "stale contents").unwrap();
		let missing = dir.path().join("nonexistent.txt");
		let report = ran(&format!("cat {} > {}", missing.display(), out.display()));
		assert_eq!(report.spawned(), 1);
		assert_ne!(report.code(), Some(0));
		assert_eq!(read(&out), "");
	}

	#[test]
	#[serial]
	fn failing_stage_does_not_stop_its_siblings() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("out");
		let missing = dir.path().join("missing");
		let report = ran(&format!("cat < {} | wc -c > {}", missing.display(), out.display()));
		assert_eq!(report.reaped(), 2);
		assert_eq!(report.children[0].status.map(|s| s.code()), Some(1));
		assert_eq!(report.children[1].status.map(|s| s.code()), Some(0));
		assert_eq!(read(&out).trim(), "0");
	}

	#[test]
	#[serial]
	fn unknown_program_fails_in_the_child_only() {
		let report = ran("no-such-program-for-pish-tests");
		assert_eq!(report.reaped(), 1);
		assert_eq!(report.code(), Some(1));
	}

	#[test]
	#[serial]
	fn unwritable_output_fails_in_the_child_only() {
		let report = ran("echo x > /nonexistent-dir/for/pish/out");
		assert_eq!(report.code(), Some(1));
	}

	#[test]
	#[serial]
	fn cd_runs_in_the_interpreter() {
		let saved = env::current_dir().unwrap();
		let dir = tempfile::tempdir().unwrap();
		match run_line(&format!("cd {}", dir.path().display())).unwrap() {
			Outcome::Builtin(r) => r.unwrap(),
			Outcome::Ran(_) => panic!("cd spawned a process"),
		}
		let now = env::current_dir().unwrap().canonicalize().unwrap();
		env::set_current_dir(saved).unwrap();
		assert_eq!(now, dir.path().canonicalize().unwrap());
	}

	#[test]
	#[serial]
	fn cd_errors_are_recoverable() {
		match run_line("cd a b").unwrap() {
			Outcome::Builtin(Err(CdError::Usage)) => (),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn cd_is_rejected_inside_pipelines() {
		for line in &["cd / | cat", "ls | cd /", "cd / > out", "cd < in"] {
			let pipeline = parser::parse(line.as_bytes()).unwrap();
			match plan(&pipeline) {
				Err(e @ ExecError::BuiltinPlacement("cd")) => assert!(!e.is_fatal()),
				other => panic!("{}: unexpected {:?}", line, other),
			}
		}
	}

	#[test]
	fn plan_separates_builtins_from_programs() {
		let pipeline = parser::parse(b"cd /tmp").unwrap();
		assert!(matches!(plan(&pipeline), Ok(Plan::Builtin(Builtin::ChangeDir, args)) if args.len() == 1));
		let pipeline = parser::parse(b"ls | wc").unwrap();
		assert!(matches!(plan(&pipeline), Ok(Plan::External(ref l)) if l.len() == 2));
	}

	#[test]
	#[serial]
	fn interrupted_wait_cancels_and_still_reaps() {
		signals::install().unwrap();
		signals::clear();
		let me = nix::sys::pthread::pthread_self();
		let interrupter = thread::spawn(move || {
			thread::sleep(Duration::from_millis(300));
			nix::sys::pthread::pthread_kill(me, Signal::SIGINT).unwrap();
		});
		let report = ran("sleep 10");
		interrupter.join().unwrap();
		assert!(report.interrupted);
		assert!(signals::interrupted());
		assert_eq!(report.reaped(), 1);
		assert!(matches!(report.children[0].status, Some(WaitStatus::Signaled(_, Signal::SIGINT, _))));
		signals::clear();
	}
}
