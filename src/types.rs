use std::borrow::Cow;
use std::fmt;

/// A word of the command line, borrowed from the line unless quoting forced a copy.
pub type Word<'a> = Cow<'a, [u8]>;

#[derive(Debug, PartialEq, Eq)]
pub struct Stage<'a> {
	pub argv: Vec<Word<'a>>,
	pub input: Option<Word<'a>>,
	pub output: Option<Word<'a>>,
}

impl<'a> Stage<'a> {
	pub fn name(&self) -> &[u8] {
		&self.argv[0]
	}

	pub fn arguments(&self) -> &[Word<'a>] {
		&self.argv[1..]
	}

	pub fn is_redirected(&self) -> bool {
		self.input.is_some() || self.output.is_some()
	}
}

#[derive(Debug, PartialEq, Eq)]
pub struct Pipeline<'a> {
	pub stages: Vec<Stage<'a>>,
}

impl<'a> Pipeline<'a> {
	pub fn len(&self) -> usize {
		self.stages.len()
	}
}

fn lossy(word: &[u8]) -> String {
	String::from_utf8_lossy(word).into_owned()
}

impl<'a> fmt::Display for Pipeline<'a> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let last = self.stages.len().saturating_sub(1);
		for (i, stage) in self.stages.iter().enumerate() {
			let line: Vec<String> = stage.argv.iter().map(|w| lossy(w)).collect();
			writeln!(f, "--------")?;
			writeln!(f, "Stage {}: \"{}\"", i, line.join(" "))?;
			writeln!(f, "--------")?;
			match (&stage.input, i) {
				(Some(path), _) => writeln!(f, "{:>10}: {}", "input", lossy(path))?,
				(None, 0) => writeln!(f, "{:>10}: original stdin", "input")?,
				(None, _) => writeln!(f, "{:>10}: pipe from stage {}", "input", i - 1)?,
			}
			match &stage.output {
				Some(path) => writeln!(f, "{:>10}: {}", "output", lossy(path))?,
				None if i == last => writeln!(f, "{:>10}: original stdout", "output")?,
				None => writeln!(f, "{:>10}: pipe to stage {}", "output", i + 1)?,
			}
			writeln!(f, "{:>10}: {}", "argc", stage.argv.len())?;
			let quoted: Vec<String> = line.iter().map(|w| format!("\"{}\"", w)).collect();
			writeln!(f, "{:>10}: {}", "argv", quoted.join(","))?;
		}
		Ok(())
	}
}
