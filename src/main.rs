use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, warn};
use serde_derive::Serialize;

use frameguess::amd64::{Amd64Platform, ThreadState};
use frameguess::core::memory::{CountingMemory, TargetMemory};
use frameguess::core::process::{Pid, Process, ProcessRetry};
use frameguess::guesser::CurrentFrameGuesser;
use frameguess::storage::{self, TargetDescription};
use frameguess::walker::{self, DEFAULT_MAX_FRAMES};
use frameguess::{Guess, DEFAULT_SEARCH_BYTES};

/// Guess the current frame of a suspended managed-runtime thread.
#[derive(Parser)]
#[command(name = "frameguess", version, about)]
struct Cli {
    /// Log every rejected candidate (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the guessed SP, FP and PC
    Guess {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Guess, then walk the sender chain from the guessed frame
    Walk {
        #[command(flatten)]
        target: TargetArgs,

        /// Stop after this many frames
        #[arg(long, default_value_t = DEFAULT_MAX_FRAMES)]
        max_frames: usize,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Target description (JSON) with the runtime layout and the thread's registers
    #[arg(short, long)]
    target: PathBuf,

    /// How many bytes of stack above SP to search, decimal or 0x-prefixed hex
    #[arg(long, default_value_t = DEFAULT_SEARCH_BYTES, value_parser = parse_size)]
    max_bytes: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Read memory from this live process instead of the description's memory segments
    #[arg(short, long)]
    pid: Option<Pid>,

    /// Hold the process lock while guessing
    #[arg(long, requires = "pid")]
    lock: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_size(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid size {:?}: {}", s, e))
}

fn main() {
    if let Err(x) = do_main() {
        eprintln!("Error. Causes: ");
        for c in x.chain() {
            eprintln!("- {}", c);
        }
        std::process::exit(1);
    }
}

fn do_main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let (target, max_frames) = match &cli.command {
        Command::Guess { target } => (target, None),
        Command::Walk { target, max_frames } => (target, Some(*max_frames)),
    };
    let description = storage::load(&target.target)?;

    match target.pid {
        Some(pid) => {
            if !description.memory.is_empty() {
                warn!(
                    "reading process {}, ignoring {} memory segments in {}",
                    pid,
                    description.memory.len(),
                    target.target.display()
                );
            }
            let process = Process::new_with_retry(pid, 10)?;
            let _lock = if target.lock {
                Some(
                    process
                        .lock()
                        .context("locking process during frame guess")?,
                )
            } else {
                None
            };
            run(&process, &description, target, max_frames)
        }
        None => {
            let memory = description.memory()?;
            run(&memory, &description, target, max_frames)
        }
    }
}

fn run<M: TargetMemory>(
    memory: &M,
    description: &TargetDescription,
    target: &TargetArgs,
    max_frames: Option<usize>,
) -> Result<()> {
    let memory = CountingMemory::new(memory);
    let layout = &description.layout;
    let platform = Amd64Platform::new(&memory, layout);
    let thread = ThreadState::new(
        platform,
        description.registers,
        description.checkpoint_source()?,
    );

    let guess = CurrentFrameGuesser::new(layout, &platform, &thread).guess_frame(target.max_bytes);
    debug!(
        "guess read target memory {} times, highest address {:?}",
        memory.reads(),
        memory.highest_address().map(|a| format!("{:#x}", a))
    );

    let max_frames = match max_frames {
        Some(max_frames) if guess.success => max_frames,
        _ => return print_guess(&guess, target.format),
    };

    let walk = walker::walk(&platform, &guess.result, max_frames)
        .context("build the guessed frame")?;
    match target.format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Output<'a> {
                guess: &'a Guess,
                walk: &'a walker::StackWalk,
            }
            let output = Output {
                guess: &guess,
                walk: &walk,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            for (i, frame) in walk.frames.iter().enumerate() {
                println!("#{:<3} {}", i, frame);
            }
            println!("({})", walk.stop);
        }
    }
    Ok(())
}

fn print_guess(guess: &Guess, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(guess)?),
        OutputFormat::Text if guess.success => println!("{}", guess.result),
        OutputFormat::Text => println!("no trustworthy frame (closest: {})", guess.result),
    }
    if guess.success {
        Ok(())
    } else {
        Err(anyhow!("couldn't guess the current frame"))
    }
}
