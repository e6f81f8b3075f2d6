//! Marionette - remote-control call injection over a debugger REPL.
//!
//! Entry point: launches a debug session and pumps it, printing the REPL
//! transcript as it accumulates. The session is ticked at a short interval
//! and the transcript drained at a much slower one.

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;

use marionette::debug::{DebugSession, SessionConfig};

/// Tick interval for the protocol pump.
const TICK_INTERVAL: Duration = Duration::from_millis(1);
/// Drain interval for the transcript poller.
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Marionette: drive a live target through an attached debugger REPL
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target program command line
    #[arg(short, long)]
    target: Option<String>,

    /// Debugger command line ({pid} is replaced with the target's pid)
    #[arg(short, long)]
    debugger: Option<String>,

    /// Invoke callback N once the target has published its table
    #[arg(long)]
    fire: Option<usize>,

    /// Integer arguments for --fire (up to three)
    #[arg(long = "fire-arg", num_args = 0..=3)]
    fire_args: Vec<u64>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    // 3. Build the session configuration
    let mut config = SessionConfig::default();
    if let Some(target) = args.target {
        config.target_command = target;
    }
    if let Some(debugger) = args.debugger {
        config.debugger_command = debugger;
    }

    let mut call_args = [0u64; 3];
    for (slot, value) in call_args.iter_mut().zip(&args.fire_args) {
        *slot = *value;
    }
    let mut fire = args.fire;

    // 4. Run the session until the target goes away
    let mut session = DebugSession::new(config);
    session.start()?;
    println!(
        "[*] marionette v{} - session started",
        env!("CARGO_PKG_VERSION")
    );

    let mut last_drain = Instant::now();
    while session.is_active() {
        if let Err(e) = session.tick() {
            eprintln!("{}", format!("Session error: {}", e).red());
            session.stop();
            break;
        }

        if fire.is_some() && !session.callbacks().is_empty() {
            if let Some(index) = fire.take() {
                if let Err(e) = session.invoke_callback(index, call_args) {
                    eprintln!(
                        "{}",
                        format!("Cannot invoke callback {}: {}", index, e).red()
                    );
                }
            }
        }

        if last_drain.elapsed() >= DRAIN_INTERVAL {
            print_transcript(&session.drain_log());
            last_drain = Instant::now();
        }

        thread::sleep(TICK_INTERVAL);
    }

    print_transcript(&session.drain_log());
    println!("[*] session ended");
    Ok(())
}

fn print_transcript(text: &str) {
    if !text.is_empty() {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }
}
