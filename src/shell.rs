use std::fmt;
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::eval::{self, ExecError, Outcome};
use crate::parser;
use crate::reader::{Input, LineReader};
use crate::signals;

pub const PROMPT: &[u8] = b"pish> ";

#[derive(Debug, Error)]
pub enum ShellError {
	#[error("i/o: {0}")]
	Io(#[from] io::Error),
	#[error(transparent)]
	Exec(#[from] ExecError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
	pub verbose: bool,
	pub parse_only: bool,
	pub prompt: bool,
}

/// The option block shown by `-v` before the first prompt.
impl fmt::Display for Config {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		writeln!(f, "Options:")?;
		writeln!(f, "  verbose    = {}", self.verbose)?;
		writeln!(f, "  parse_only = {}", self.parse_only)?;
		writeln!(f, "  prompt     = {}", self.prompt)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	Terminate,
}

/// The read-eval loop: one line is read, parsed, run and released per cycle.
pub struct Shell<R, W> {
	config: Config,
	reader: LineReader<R>,
	out: W,
}

impl<R: Read, W: Write> Shell<R, W> {
	pub fn new(config: Config, source: R, out: W) -> Shell<R, W> {
		Shell { config: config, reader: LineReader::new(source), out: out }
	}

	fn prompt(&mut self) -> io::Result<()> {
		if self.config.prompt {
			self.out.write_all(PROMPT)?;
			self.out.flush()?;
		}
		Ok(())
	}

	pub fn cycle(&mut self) -> Result<Flow, ShellError> {
		signals::clear();
		self.prompt()?;
		let flow = match self.reader.read_line()? {
			Input::Eof => {
				debug!("end of input");
				if self.config.prompt {
					writeln!(self.out)?;
				}
				Flow::Terminate
			},
			Input::Interrupted => {
				debug!("line abandoned");
				if self.config.prompt {
					writeln!(self.out)?;
				}
				Flow::Continue
			},
			Input::Line(line) => {
				evaluate(&self.config, &mut self.out, line)?;
				Flow::Continue
			},
		};
		self.reader.reset();
		Ok(flow)
	}

	pub fn run(&mut self) -> Result<(), ShellError> {
		while self.cycle()? == Flow::Continue {}
		Ok(())
	}
}

fn evaluate<W: Write>(config: &Config, out: &mut W, line: &[u8]) -> Result<(), ShellError> {
	let pipeline = match parser::parse(line) {
		Ok(p) => p,
		Err(e) => {
			if !e.is_silent() {
				eprintln!("pish: {}", e);
			}
			return Ok(());
		},
	};

	if config.verbose || config.parse_only {
		write!(out, "{}", pipeline)?;
		out.flush()?;
	}
	if config.parse_only {
		return Ok(());
	}

	match eval::execute(&pipeline) {
		Ok(Outcome::Builtin(Ok(()))) => {},
		Ok(Outcome::Builtin(Err(e))) => eprintln!("{}", e),
		Ok(Outcome::Ran(report)) => {
			debug!(stages = report.spawned(), channels = report.channels, reaped = report.reaped(), code = ?report.code(), interrupted = report.interrupted, "pipeline finished");
		},
		Err(ref e) if !e.is_fatal() => eprintln!("pish: {}", e),
		Err(e) => { return Err(e.into()); },
	}
	Ok(())
}
