use std::ops::Bound;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use silt::iterators::StorageIterator;
use silt::lsm_storage::{LsmStorageOptions, Silt};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "silt-cli", about = "Interactive shell over a silt store")]
struct Args {
    /// Directory holding the store's table files.
    #[arg(long, default_value = "silt.db")]
    path: PathBuf,
    /// JSON file with engine options; defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug)]
enum Command {
    Put { key: String, value: String },
    Del { key: String },
    Get { key: String },
    Scan { lower: Option<String>, upper: Option<String> },
    Flush,
    Help,
    Exit,
}

impl Command {
    fn parse(input: &str) -> Result<Self> {
        use nom::branch::*;
        use nom::bytes::complete::*;
        use nom::character::complete::*;
        use nom::combinator::*;
        use nom::sequence::*;

        let string = |i| {
            map(take_till1(|c: char| c.is_whitespace()), |s: &str| {
                s.to_string()
            })(i)
        };

        let put = |i| {
            map(
                tuple((tag_no_case("put"), space1, string, space1, string)),
                |(_, _, key, _, value)| Command::Put { key, value },
            )(i)
        };

        let del = |i| {
            map(
                tuple((tag_no_case("del"), space1, string)),
                |(_, _, key)| Command::Del { key },
            )(i)
        };

        let get = |i| {
            map(
                tuple((tag_no_case("get"), space1, string)),
                |(_, _, key)| Command::Get { key },
            )(i)
        };

        let scan = |i| {
            map(
                tuple((
                    tag_no_case("scan"),
                    opt(tuple((space1, string, space1, string))),
                )),
                |(_, bounds)| {
                    let (lower, upper) =
                        bounds.map_or((None, None), |(_, lower, _, upper)| {
                            (Some(lower), Some(upper))
                        });
                    Command::Scan { lower, upper }
                },
            )(i)
        };

        let flush = |i| map(tag_no_case("flush"), |_| Command::Flush)(i);
        let help = |i| map(tag_no_case("help"), |_| Command::Help)(i);
        let exit = |i| {
            map(alt((tag_no_case("exit"), tag_no_case("quit"))), |_| {
                Command::Exit
            })(i)
        };

        let parsed: nom::IResult<&str, Command, nom::error::Error<&str>> =
            all_consuming(terminated(
                alt((put, del, get, scan, flush, help, exit)),
                multispace0,
            ))(input);
        let (_, command) = parsed.map_err(|e| anyhow::anyhow!("invalid command: {e}"))?;
        Ok(command)
    }
}

const HELP_TEXT: &str = "\
Available commands:
  put <key> <value>    store a key-value pair
  get <key>            look a key up
  del <key>            delete a key
  scan [<lo> <hi>]     list entries, optionally within [lo, hi]
  flush                persist frozen memtables to disk
  help                 show this message
  exit                 quit the shell";

fn load_options(args: &Args) -> Result<LsmStorageOptions> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(LsmStorageOptions::default()),
    }
}

fn run_command(db: &Silt, command: Command) -> Result<bool> {
    match command {
        Command::Put { key, value } => {
            db.put(key.as_bytes(), value.as_bytes())?;
            println!("ok");
        }
        Command::Del { key } => {
            db.delete(key.as_bytes())?;
            println!("ok");
        }
        Command::Get { key } => match db.get(key.as_bytes())? {
            Some(value) => println!("{}={}", key, String::from_utf8_lossy(&value)),
            None => println!("{key} not found"),
        },
        Command::Scan { lower, upper } => {
            let lower = lower
                .as_ref()
                .map_or(Bound::Unbounded, |k| Bound::Included(k.as_bytes()));
            let upper = upper
                .as_ref()
                .map_or(Bound::Unbounded, |k| Bound::Included(k.as_bytes()));
            let mut iter = db.scan(lower, upper)?;
            let mut count = 0usize;
            while iter.is_valid() {
                println!(
                    "{}={}",
                    String::from_utf8_lossy(iter.key()),
                    String::from_utf8_lossy(iter.value())
                );
                count += 1;
                iter.next()?;
            }
            println!("{count} entries");
        }
        Command::Flush => {
            db.force_flush()?;
            println!("ok");
        }
        Command::Help => println!("{HELP_TEXT}"),
        Command::Exit => return Ok(false),
    }
    Ok(true)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let options = load_options(&args)?;
    let db = Silt::open(&args.path, options)?;

    let mut editor = DefaultEditor::new()?;
    println!("silt shell; type 'help' for commands");
    loop {
        let line = match editor.readline("silt> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        editor.add_history_entry(line)?;
        match Command::parse(line) {
            Ok(command) => match run_command(&db, command) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("error: {e}"),
            },
            Err(_) => println!("unknown command: {line}"),
        }
    }
    db.close()?;
    Ok(())
}
