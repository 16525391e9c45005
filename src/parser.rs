use std::borrow::Cow;

use thiserror::Error;

use crate::types::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty command line")]
	Empty,
	#[error("invalid null command")]
	NullCommand,
	#[error("{0}: bad input redirection")]
	BadInput(String),
	#[error("{0}: bad output redirection")]
	BadOutput(String),
	#[error("unterminated quoted string")]
	BadString,
}

impl ParseError {
	/// Blank lines are skipped without a report.
	pub fn is_silent(&self) -> bool {
		*self == ParseError::Empty
	}
}

pub type ParseResult<T> = Result<T, ParseError>;

struct Parser<'a> {
	line: &'a [u8],
	i: usize,
}

fn describe(stage: &Stage) -> String {
	String::from_utf8_lossy(stage.name()).into_owned()
}

impl<'a> Parser<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		matches!(c, b' ' | b'\t' | b'\n' | b'\r')
	}

	fn is_letter(c: u8) -> bool {
		match c {
			b'>' | b'<' | b'|' | b'"' => false,
			_ => !Parser::is_whitespace(c),
		}
	}

	fn peek(&self) -> Option<u8> {
		self.line.get(self.i).cloned()
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Parser::is_whitespace);
	}

	/// Reads one word, gluing quoted and unquoted runs together. `None` when no word starts here.
	fn read_word(&mut self) -> ParseResult<Option<Word<'a>>> {
		let line = self.line;
		let orig = self.i;
		let mut owned: Option<Vec<u8>> = None;
		loop {
			let start = self.i;
			self.proceed_while(Parser::is_letter);
			if let Some(buf) = owned.as_mut() {
				buf.extend_from_slice(&line[start .. self.i]);
			}
			if self.peek() != Some(b'"') {
				break;
			}
			let buf = owned.get_or_insert_with(|| line[orig .. self.i].to_vec());
			self.i += 1;
			let rest = &line[self.i ..];
			match rest.iter().position(|&c| c == b'"') {
				Some(n) => {
					buf.extend_from_slice(&rest[.. n]);
					self.i += n + 1;
				},
				None => { return Err(ParseError::BadString); },
			}
		}
		if self.i == orig {
			return Ok(None);
		}
		Ok(Some(match owned {
			Some(buf) => Cow::Owned(buf),
			None => Cow::Borrowed(&line[orig .. self.i]),
		}))
	}

	fn read_target(&mut self) -> ParseResult<Option<Word<'a>>> {
		self.i += 1;
		self.skip_whitespaces();
		self.read_word()
	}

	fn parse_stage(&mut self) -> ParseResult<Stage<'a>> {
		let mut argv: Vec<Word<'a>> = vec![];
		let mut input: Option<Word<'a>> = None;
		let mut output: Option<Word<'a>> = None;
		let mut bad_input = false;
		let mut bad_output = false;

		loop {
			self.skip_whitespaces();
			match self.peek() {
				None | Some(b'|') => { break; },
				Some(b'<') => match self.read_target()? {
					Some(target) if input.is_none() => input = Some(target),
					_ => bad_input = true,
				},
				Some(b'>') => match self.read_target()? {
					Some(target) if output.is_none() => output = Some(target),
					_ => bad_output = true,
				},
				Some(_) => match self.read_word()? {
					Some(word) => argv.push(word),
					None => { break; },
				},
			}
		}

		if argv.is_empty() {
			return Err(ParseError::NullCommand);
		}
		let stage = Stage { argv: argv, input: input, output: output };
		if bad_input {
			return Err(ParseError::BadInput(describe(&stage)));
		}
		if bad_output {
			return Err(ParseError::BadOutput(describe(&stage)));
		}
		Ok(stage)
	}

	fn parse_pipeline(&mut self) -> ParseResult<Pipeline<'a>> {
		let mut stages: Vec<Stage<'a>> = vec![];

		self.skip_whitespaces();
		if self.peek().is_none() {
			return Err(ParseError::Empty);
		}

		loop {
			let stage = self.parse_stage()?;
			if !stages.is_empty() && stage.input.is_some() {
				return Err(ParseError::BadInput(describe(&stage)));
			}
			match self.peek() {
				Some(b'|') => {
					self.i += 1;
					if stage.output.is_some() {
						return Err(ParseError::BadOutput(describe(&stage)));
					}
					stages.push(stage);
				},
				_ => {
					stages.push(stage);
					break;
				},
			}
		}
		Ok(Pipeline { stages: stages })
	}
}

pub fn parse<'a>(line: &'a [u8]) -> ParseResult<Pipeline<'a>> {
	let mut parser: Parser<'a> = Parser { line: line, i: 0 };
	parser.parse_pipeline()
}
