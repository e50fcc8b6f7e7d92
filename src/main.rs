//! Ring DHT peer binary.
//!
//! Starts one peer of the ring and reads commands from standard input.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- <ID> <SUCCESSOR1> <SUCCESSOR2>
//! ```
//!
//! Peer `n` listens on UDP and TCP port `50000 + n`. While running:
//!
//! - `request <key>` sends a file request to the first successor
//! - `quit` notifies predecessors and exits
//! - any other line is echoed

use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use ring_dht::{FileKey, FileResponse, FileResponseHook, Peer, PeerConfig, PeerId};

/// One peer of a circular DHT.
#[derive(Parser, Debug)]
#[command(name = "ring-dht")]
struct Args {
    /// This peer's id, 0-255
    #[arg(value_parser = parse_peer_arg)]
    id: PeerId,
    /// First successor id, 0-255
    #[arg(value_parser = parse_peer_arg)]
    successor1: PeerId,
    /// Second successor id, 0-255
    #[arg(value_parser = parse_peer_arg)]
    successor2: PeerId,
    /// Milliseconds between liveness probes
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    ping_interval_ms: u64,
    /// Log filter, e.g. `info` or `ring_dht=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Validate a ring id argument: at most three decimal digits, at most 255.
fn parse_peer_arg(arg: &str) -> Result<PeerId, String> {
    if arg.len() > 3 {
        return Err(format!(
            "argument '{arg}' has more than 3 characters and hence is out of range"
        ));
    }
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("argument '{arg}' is not an integer in the range [0,255]"));
    }
    arg.parse::<u16>()
        .ok()
        .and_then(|n| PeerId::try_from(n).ok())
        .ok_or_else(|| format!("argument '{arg}' is out of range"))
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Quit,
    Request(FileKey),
    Echo,
}

impl Command {
    fn parse(line: &str) -> Self {
        if line == "quit" {
            return Command::Quit;
        }
        let key = line
            .strip_prefix("request")
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .map(str::trim_start)
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse().ok());
        match key {
            Some(key) => Command::Request(key),
            None => Command::Echo,
        }
    }
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).map_err(|err| anyhow!("invalid log filter: {err}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config = PeerConfig::new(args.id, [args.successor1, args.successor2])
        .with_ping_interval(Duration::from_millis(args.ping_interval_ms));

    let hook: FileResponseHook = Arc::new(|response: &FileResponse| {
        println!(
            "Received a response message from peer {}, which has the file {}.",
            response.responder, response.key
        );
    });
    let peer = Peer::start_with_hook(config, Some(hook)).await?;

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Quit => break,
            Command::Request(key) => match peer.request_file(key).await {
                Ok(_) => println!("File request message for {key} has been sent to my successor."),
                Err(err) => eprintln!("{err}"),
            },
            Command::Echo => println!("{line}"),
        }
    }

    peer.shutdown().await;
    Ok(())
}
