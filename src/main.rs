//! Literal search over byte streams.
//!
//! Searches each input argument for a literal byte sequence, streaming
//! one byte at a time through the matching engine.  The pattern is the
//! classic unanchored search: at every position, either the needle
//! starts here (preferred) or one byte is skipped and the search
//! restarts at the next position.  At most `needle.len()` partial
//! matches are ever in flight per attempt.
//!
//! Exit status: 0 if every input contained the needle, 1 if any input
//! did not, 2 on errors.

use std::process;
use std::rc::Rc;

use clap::Parser;
use streamatch::{
    Continuation, Engine, Options, Pattern, ProtocolError, Symbol, Transition,
};

/// Scan inputs for a literal byte sequence, one byte at a time.
#[derive(clap::Parser, Debug)]
#[command(version)]
struct Cli {
    /// Literal byte sequence to search for.
    needle: String,

    /// Inputs to scan; each argument is one independent stream.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Report every occurrence instead of stopping after the first.
    #[arg(short, long)]
    global: bool,

    #[clap(flatten)]
    logging: LogArgs,
}

/// Logging setup arg group.
#[derive(clap::Args, Debug)]
struct LogArgs {
    /// Silence log messages.
    #[clap(short, long)]
    quiet: bool,

    /// Turn debugging information on (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl LogArgs {
    fn setup_logging(&self) -> Result<(), Box<dyn std::error::Error>> {
        let log_level = match self.verbose {
            0 => stderrlog::LogLevelNum::Warn,
            1 => stderrlog::LogLevelNum::Info,
            2 => stderrlog::LogLevelNum::Debug,
            _ => stderrlog::LogLevelNum::Trace,
        };

        stderrlog::new()
            .quiet(self.quiet)
            .verbosity(log_level)
            .init()?;

        Ok(())
    }
}

/// Unanchored literal search over bytes.
struct LiteralSearch {
    needle: Rc<Vec<u8>>,
}

/// Per-thread progress: bytes skipped before the match began plus the
/// needle bytes matched so far.  Doubles as the capture payload.
#[derive(Clone, Debug, Default)]
struct Scan {
    skipped: u64,
    matched: Vec<u8>,
}

impl Pattern for LiteralSearch {
    type Token = u8;
    type State = Scan;
    type Captures = Scan;

    fn initial_state(&self) -> Scan {
        Scan::default()
    }

    fn initial_continuation(&self) -> Continuation<Self> {
        search(Rc::clone(&self.needle))
    }
}

/// Start the needle at this position (preferred) or skip one byte and
/// search again from the next.
fn search(needle: Rc<Vec<u8>>) -> Continuation<LiteralSearch> {
    Continuation::peek(move |_: &mut Scan, _| {
        let here = expect(Rc::clone(&needle), 0);
        let skip = {
            let needle = Rc::clone(&needle);
            Continuation::consume(move |scan: &mut Scan, _: &u8| {
                scan.skipped += 1;
                Transition::Branch(vec![search(Rc::clone(&needle))])
            })
        };
        Transition::Branch(vec![here, skip])
    })
}

/// Consume `needle[i..]` byte by byte; succeed after the last one.
fn expect(needle: Rc<Vec<u8>>, i: usize) -> Continuation<LiteralSearch> {
    Continuation::consume(move |scan: &mut Scan, byte: &u8| {
        if *byte != needle[i] {
            return Transition::Fail;
        }
        scan.matched.push(*byte);
        if i + 1 == needle.len() {
            Transition::Succeed(scan.clone())
        } else {
            Transition::Branch(vec![expect(Rc::clone(&needle), i + 1)])
        }
    })
}

/// Stream one input through a fresh engine, printing each occurrence.
/// Returns the number of occurrences found.
fn scan_input(needle: &Rc<Vec<u8>>, global: bool, input: &str) -> Result<usize, ProtocolError> {
    let pattern = LiteralSearch {
        needle: Rc::clone(needle),
    };
    let mut engine = Engine::new(pattern, Options { global });
    // Stream offset where the current attempt began; each reported
    // range is reconstructed from it plus the thread's own counters.
    let mut base: u64 = 0;
    let mut found = 0;

    let symbols = std::iter::once(Symbol::Start)
        .chain(input.bytes().map(Symbol::Token))
        .chain(std::iter::once(Symbol::End));
    for symbol in symbols {
        engine.feed(symbol);
        if symbol.token().is_some() {
            engine.position += 1;
        }
        for event in engine.epsilon_phase()? {
            let start = base + event.captures.skipped;
            let end = start + event.captures.matched.len() as u64;
            println!(
                "  \x1b[32mfound\x1b[0m  #{} at {}..{}  {:?}",
                event.attempt,
                start,
                end,
                String::from_utf8_lossy(&event.captures.matched),
            );
            base = end;
            found += 1;
        }
        if engine.done() {
            break;
        }
        engine.consume_phase()?;
    }

    log::debug!("scanned {} of {} byte(s)", engine.position, input.len());
    Ok(found)
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = cli.logging.setup_logging() {
        eprintln!("error: failed to initialize logging: {err}");
        process::exit(2);
    }
    if cli.needle.is_empty() {
        eprintln!("error: needle must not be empty");
        process::exit(2);
    }

    let needle = Rc::new(cli.needle.clone().into_bytes());
    let mut missed = false;
    for input in &cli.inputs {
        println!("{input:?}:");
        match scan_input(&needle, cli.global, input) {
            Ok(0) => {
                println!("  \x1b[31mno match\x1b[0m");
                missed = true;
            }
            Ok(found) => {
                log::info!("{found} occurrence(s) of {:?}", cli.needle);
            }
            Err(err) => {
                eprintln!("error: {err}");
                process::exit(2);
            }
        }
    }
    if missed {
        process::exit(1);
    }
}
