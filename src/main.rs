mod types;
mod parser;
mod reader;
mod signals;
mod channel;
mod launch;
mod builtin;
mod eval;
mod shell;

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use argh::FromArgs;
use nix::unistd;
use tracing_subscriber::EnvFilter;

use shell::{Config, Shell};

#[derive(FromArgs)]
/// Run command pipelines typed at a terminal or read from a file.
struct Args {
	/// echo each parsed pipeline before running it
	#[argh(switch, short = 'v')]
	verbose: bool,

	/// echo parsed pipelines without running them
	#[argh(switch, short = 'p')]
	parse_only: bool,

	/// file of command lines to run instead of standard input
	#[argh(positional)]
	script: Option<PathBuf>,
}

fn init_logging(verbose: bool) {
	let default = if verbose { "debug" } else { "warn" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.with_target(false)
		.without_time()
		.init();
}

fn is_terminal(fd: i32) -> bool {
	unistd::isatty(fd).unwrap_or(false)
}

fn main() -> ExitCode {
	let args: Args = argh::from_env();
	init_logging(args.verbose);

	if let Err(e) = signals::install() {
		eprintln!("pish: sigaction: {}", e);
		return ExitCode::FAILURE;
	}

	let source: Box<dyn Read> = match args.script {
		Some(ref path) => match File::open(path) {
			Ok(file) => Box::new(file),
			Err(e) => {
				eprintln!("{}: {}", path.display(), e);
				return ExitCode::FAILURE;
			},
		},
		None => Box::new(io::stdin()),
	};
	let config = Config {
		verbose: args.verbose,
		parse_only: args.parse_only,
		prompt: args.script.is_none() && is_terminal(libc::STDIN_FILENO) && is_terminal(libc::STDOUT_FILENO),
	};

	if config.verbose {
		print!("{}", config);
	}

	let mut sh = Shell::new(config, source, io::stdout());
	match sh.run() {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("pish: {}", e);
			ExitCode::FAILURE
		},
	}
}
