//! Entry point for `mailnet`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode over a UDP-backed link.  `main.rs` owns only process setup (logging,
//! argument parsing); all protocol work is delegated to library modules.
//!
//! ```text
//! mailnet --bind 127.0.0.1:9000 --link 1 --peer 2=127.0.0.1:9001 server --port 40
//! mailnet --bind 127.0.0.1:9001 --link 2 --peer 1=127.0.0.1:9000 client --remote-link 1 --remote-port 40
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mailnet::link::{LinkAddr, DEFAULT_MAX_PACKET_PAYLOAD};
use mailnet::receiver::OrderPolicy;
use mailnet::socket::UdpLink;
use mailnet::{Config, Connection, Port, PostOffice};

/// Reliable port-addressed connections over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct LinkArgs {
    /// Local UDP address to bind.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,
    /// Link address of this machine.
    #[arg(short, long, default_value_t = 1)]
    link: LinkAddr,
    /// Peer link as LINK=HOST:PORT; repeat for several peers.
    #[arg(short, long = "peer", value_parser = parse_peer)]
    peers: Vec<(LinkAddr, SocketAddr)>,
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    rto_ms: u64,
    /// Retransmissions before giving up on a segment or handshake.
    #[arg(long, default_value_t = 6)]
    max_retries: u32,
    /// Never resend lost segments.
    #[arg(long)]
    no_retransmit: bool,
    /// Deliver data in arrival order instead of sequence order.
    #[arg(long)]
    arrival_order: bool,
}

impl LinkArgs {
    fn config(&self) -> Config {
        Config {
            retransmit: !self.no_retransmit,
            initial_rto: Duration::from_millis(self.rto_ms),
            max_retries: self.max_retries,
            order: if self.arrival_order {
                OrderPolicy::AcceptAnyway
            } else {
                OrderPolicy::Reorder
            },
            ..Config::default()
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections on a port and print what they send.
    Server {
        #[arg(short, long, default_value_t = 40)]
        port: Port,
    },
    /// Connect to a remote port and send stdin line by line.
    Client {
        #[arg(long)]
        remote_link: LinkAddr,
        #[arg(long)]
        remote_port: Port,
    },
}

fn parse_peer(s: &str) -> Result<(LinkAddr, SocketAddr), String> {
    let (link, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LINK=HOST:PORT, got {s:?}"))?;
    let link = link.parse().map_err(|e| format!("bad link address {link:?}: {e}"))?;
    let addr = addr.parse().map_err(|e| format!("bad socket address {addr:?}: {e}"))?;
    Ok((link, addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.link.config();
    let peers: HashMap<_, _> = cli.link.peers.iter().copied().collect();

    let (udp, link) = UdpLink::bind(cli.link.bind, cli.link.link, peers, DEFAULT_MAX_PACKET_PAYLOAD)
        .await
        .context("binding UDP link")?;
    log::info!("link {} on {}", cli.link.link, udp.local_addr);
    let post_office = PostOffice::new(link, config);

    match cli.mode {
        Mode::Server { port } => serve(post_office, port).await,
        Mode::Client {
            remote_link,
            remote_port,
        } => send_stdin(post_office, remote_link, remote_port).await,
    }
}

async fn serve(post_office: Arc<PostOffice>, port: Port) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 512];
    loop {
        let mut conn = Connection::accept(Arc::clone(&post_office), port)
            .await
            .context("accept failed")?;
        log::info!("accepted connection from {}", conn.remote());

        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            stdout.flush().await?;
        }
        log::info!("connection from {} closed", conn.remote());
    }
}

async fn send_stdin(post_office: Arc<PostOffice>, remote_link: LinkAddr, remote_port: Port) -> Result<()> {
    let mut conn = Connection::open(post_office, remote_link, remote_port)
        .await
        .context("connect failed")?;
    log::info!("connected {} → {}", conn.local(), conn.remote());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        conn.write(format!("{line}\n").as_bytes()).await?;
    }
    conn.close().await?;
    Ok(())
}
