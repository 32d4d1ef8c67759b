pub mod builtins;
pub mod execution;
pub mod handlers;
pub mod job;
pub mod parser;
pub mod sig;

use std::error::Error;
use std::io::{self, BufRead, Write};

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::{Cmd, DefaultEditor, KeyEvent};

const PROMPT: &str = "tsh> ";

/// A tiny shell with job control.
#[derive(Parser, Debug)]
#[command(name = "tsh", version, about)]
struct Args {
    /// Print additional diagnostic information
    #[arg(short, long)]
    verbose: bool,

    /// Do not emit a command prompt
    #[arg(short = 'p', long = "no-prompt")]
    no_prompt: bool,
}

enum LineSource {
    Editor(DefaultEditor),
    Stdin { prompt: bool },
}

impl LineSource {
    fn new(prompt: bool) -> Result<Self, ReadlineError> {
        if !prompt || unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
            return Ok(LineSource::Stdin { prompt });
        }

        let mut editor = DefaultEditor::new()?;
        // ctrl-z at the prompt must not suspend the shell
        editor.bind_sequence(KeyEvent::ctrl('z'), Cmd::Noop);
        Ok(LineSource::Editor(editor))
    }

    /// Next input line, or `None` at end of input.
    fn next_line(&mut self) -> Result<Option<String>, Box<dyn Error>> {
        match self {
            LineSource::Editor(editor) => loop {
                match editor.readline(PROMPT) {
                    Ok(line) => {
                        let _ = editor.add_history_entry(line.as_str());
                        return Ok(Some(line));
                    }
                    // ctrl-c discards the line being edited
                    Err(ReadlineError::Interrupted) => continue,
                    Err(ReadlineError::Eof) => return Ok(None),
                    Err(ReadlineError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                        log::warn!("discarding input line that is not valid UTF-8");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            },
            LineSource::Stdin { prompt } => {
                if *prompt {
                    print!("{}", PROMPT);
                    io::stdout().flush()?;
                }

                let mut line = Vec::new();
                match io::stdin().lock().read_until(b'\n', &mut line)? {
                    0 => Ok(None),
                    _ => Ok(Some(String::from_utf8_lossy(&line).into_owned())),
                }
            }
        }
    }
}

fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logger(args.verbose);

    handlers::install()?;

    let mut input = LineSource::new(!args.no_prompt)?;
    while let Some(line) = input.next_line()? {
        match execution::eval(&line) {
            Ok(()) => {}
            Err(error) if error.is_fatal() => {
                log::error!("{}", error);
                eprintln!("{}", error);
                std::process::exit(1);
            }
            Err(error) if error.is_user_facing() => println!("{}", error),
            Err(error) => eprintln!("tsh: {}", error),
        }
    }

    Ok(())
}
