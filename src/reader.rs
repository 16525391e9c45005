use std::io::{self, ErrorKind, Read};

use tracing::trace;

use crate::signals;

const CHUNK: usize = 4096;
const LINE_CAPACITY: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub enum Input<'r> {
	Line(&'r [u8]),
	Eof,
	/// SIGINT arrived mid-read; the partial line is gone but the stream is still usable.
	Interrupted,
}

/// Splits a byte stream into lines without retrying reads that SIGINT interrupts.
pub struct LineReader<R> {
	source: R,
	line: Vec<u8>,
	pending: Vec<u8>,
	eof: bool,
}

impl<R: Read> LineReader<R> {
	pub fn new(source: R) -> LineReader<R> {
		LineReader {
			source: source,
			line: Vec::with_capacity(LINE_CAPACITY),
			pending: Vec::new(),
			eof: false,
		}
	}

	pub fn read_line(&mut self) -> io::Result<Input<'_>> {
		self.line.clear();
		loop {
			if let Some(n) = self.pending.iter().position(|&c| c == b'\n') {
				self.line.extend(self.pending.drain(..= n));
				return Ok(Input::Line(&self.line));
			}
			if self.eof {
				if self.pending.is_empty() {
					return Ok(Input::Eof);
				}
				self.line.append(&mut self.pending);
				return Ok(Input::Line(&self.line));
			}

			let mut chunk = [0u8; CHUNK];
			match self.source.read(&mut chunk) {
				Ok(0) => { self.eof = true; },
				Ok(n) => self.pending.extend_from_slice(&chunk[.. n]),
				Err(ref e) if e.kind() == ErrorKind::Interrupted => {
					if signals::interrupted() {
						trace!(discarded = self.pending.len(), "read interrupted");
						self.pending.clear();
						return Ok(Input::Interrupted);
					}
				},
				Err(e) => { return Err(e); },
			}
		}
	}

	/// Drops per-line state so one long line does not pin memory for the rest of the session.
	pub fn reset(&mut self) {
		self.line.clear();
		self.line.shrink_to(LINE_CAPACITY);
		if self.pending.is_empty() {
			self.pending.shrink_to(0);
		}
	}
}
