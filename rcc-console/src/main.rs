//! Interactive instrument console: entry point.
//!
//! ```text
//! rcc-console                      Connect with defaults
//! rcc-console --config <path>      Use custom config TOML
//! rcc-console --host 10.0.0.5      Override the instrument address
//! rcc-console --gen-config         Dump default config and exit
//! ```
//!
//! Every stdin line is sent as one command. Lines starting with `:` are
//! handled locally: `:status`, `:culture <tag>`, `:encoding <name>`,
//! `:quit`.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rcc_core::{
    Direction, Engine, EngineEvent, EventBus, LocalEventBus, OutgoingRequest, Reply, ReplySink,
    TextEncoding,
};

use crate::config::ConsoleConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rcc-console", about = "Instrument remote-control console")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rcc-console.toml")]
    config: PathBuf,

    /// Instrument host (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Instrument port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Payload encoding: utf-16le, utf-8 or ascii (overrides config).
    #[arg(short, long)]
    encoding: Option<TextEncoding>,

    /// Culture stamped on commands (overrides config).
    #[arg(long)]
    culture: Option<String>,

    /// Print a hex dump of every chunk sent and received.
    #[arg(long)]
    traffic: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Console input ────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Command(&'a str),
    Status,
    Culture(&'a str),
    Encoding(&'a str),
    Quit,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    let Some(local) = line.strip_prefix(':') else {
        return if line.is_empty() {
            Input::Empty
        } else {
            Input::Command(line)
        };
    };
    let (verb, arg) = local
        .split_once(char::is_whitespace)
        .map(|(v, a)| (v, a.trim()))
        .unwrap_or((local, ""));
    match verb {
        "status" => Input::Status,
        "culture" if !arg.is_empty() => Input::Culture(arg),
        "encoding" if !arg.is_empty() => Input::Encoding(arg),
        "quit" | "q" => Input::Quit,
        _ => Input::Unknown(local),
    }
}

/// Prints replies and outbound commands to stdout.
struct PrintSink;

impl ReplySink for PrintSink {
    fn process_response(&self, reply: Reply) {
        match reply {
            Reply::Markup(text) | Reply::Raw(text) => println!("<< {text}"),
            Reply::Failed { cookie, reason } => println!("!! {cookie}: {reason}"),
        }
    }

    fn traffic_out(&self, data: &str) {
        println!(">> {data}");
    }
}

async fn print_events(mut events: broadcast::Receiver<EngineEvent>, traffic: bool) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::MessageArrived(text)) => println!("** {text}"),
            Ok(EngineEvent::RawMessageArrived(text)) => println!("~~ {text}"),
            Ok(EngineEvent::ClientDisconnected { requested }) => {
                println!("-- disconnected (requested: {requested})");
            }
            Ok(EngineEvent::CommandFailed { .. }) => {}
            Ok(EngineEvent::TrafficRecorded(record)) => {
                if traffic {
                    let arrow = match record.direction {
                        Direction::Outbound => "tx",
                        Direction::Inbound => "rx",
                    };
                    println!("{arrow} [{}] {}", record.bytes.len(), record.hex());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("event printer lagged by {n}"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", ConsoleConfig::default_toml()?);
        return Ok(());
    }

    let mut config = ConsoleConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.connection.host = host;
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(encoding) = cli.encoding {
        config.engine.encoding = encoding;
    }
    if let Some(culture) = cli.culture {
        config.engine.culture = culture;
    }
    config.engine.record_traffic |= cli.traffic;

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rcc-console v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Engine and event printer ─────────────────────────────

    let bus = Arc::new(LocalEventBus::new());
    let printer = tokio::spawn(print_events(bus.subscribe(), cli.traffic));
    let engine = Engine::new(config.engine.clone(), bus)?;

    // ── 2. Connect ──────────────────────────────────────────────

    let (host, port) = (config.connection.host.as_str(), config.connection.port);
    if !engine.connect(host, port).await {
        error!("could not connect to {host}:{port}");
        printer.abort();
        return Err(format!("could not connect to {host}:{port}").into());
    }

    // ── 3. Command loop ─────────────────────────────────────────

    let sink: Arc<dyn ReplySink> = Arc::new(PrintSink);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Command(text) => engine.send(OutgoingRequest::new(text).with_sink(sink.clone())),
            Input::Status => println!(
                "-- {} peer={} pending={} queued={} culture={} encoding={}",
                engine.phase(),
                engine.peer().map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                engine.pending_cookie().unwrap_or_else(|| "-".into()),
                engine.queued_len(),
                engine.request_culture(),
                engine.encoding(),
            ),
            Input::Culture(tag) => engine.set_request_culture(tag),
            Input::Encoding(name) => match name.parse::<TextEncoding>() {
                Ok(encoding) => engine.set_encoding(encoding),
                Err(e) => println!("!! {e}"),
            },
            Input::Quit => break,
            Input::Unknown(what) => println!("!! unknown console command :{what}"),
        }
    }

    engine.disconnect().await;
    printer.abort();
    Ok(())
}
