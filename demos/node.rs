use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;

use punchlink::punchlink_core::relay::RelayServer;
use punchlink::{Builder, PeerIdentity};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the rendezvous/relay service.
    /// example: relay --listen 0.0.0.0:3478
    Relay {
        #[arg(short, long)]
        listen: SocketAddr,
    },
    /// Run a host. Prints its descriptor; with --peer and --descriptor it
    /// connects and sends a greeting, otherwise it echoes whatever arrives.
    /// example: node --id 100 --key 1 --port 23333 --relay 1.2.3.4:3478
    Node {
        #[arg(long)]
        id: i32,
        #[arg(long, default_value_t = 0)]
        key: i32,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        relay: Option<SocketAddr>,
        /// Remote identity as id:key.
        #[arg(long)]
        peer: Option<String>,
        /// Remote descriptor, as printed by the other host.
        #[arg(long)]
        descriptor: Option<String>,
    },
}

fn parse_identity(text: &str) -> anyhow::Result<PeerIdentity> {
    let (id, key) = text
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected id:key, got {text}"))?;
    Ok(PeerIdentity::new(id.parse()?, key.parse()?))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args { command } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    match command {
        Mode::Relay { listen } => {
            let mut server = RelayServer::bind(listen)?;
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            loop {
                interval.tick().await;
                server.poll()?;
            }
        }
        Mode::Node {
            id,
            key,
            port,
            relay,
            peer,
            descriptor,
        } => {
            let mut builder = Builder::new().identity(PeerIdentity::new(id, key));
            if let Some(port) = port {
                builder = builder.udp_port(port);
            }
            if let Some(relay) = relay {
                builder = builder.relay(relay);
            }
            let node = builder.build().await?;
            // the external address shows up once the relay answers
            tokio::time::sleep(Duration::from_millis(500)).await;
            log::info!("descriptor: {}", node.descriptor());

            if let (Some(peer), Some(descriptor)) = (peer, descriptor) {
                let peer = parse_identity(&peer)?;
                let port = node.connect(peer, &descriptor)?;
                node.wait_established(port, Duration::from_secs(20)).await?;
                log::info!("connected to {peer} via {:?}", node.lock().path(port));
                node.send(port, 0, b"hello")?;
                let (channel, reply) = node.recv(port).await?;
                log::info!("reply on channel {channel}: {:?}", String::from_utf8_lossy(&reply));
                return Ok(());
            }
            loop {
                let accepted = node.accept().await;
                log::info!("accepted {}:{}", accepted.peer, accepted.peer_port);
                if let Err(e) = node
                    .wait_established(accepted.port, Duration::from_secs(20))
                    .await
                {
                    log::warn!("{}: {e}", accepted.port);
                    continue;
                }
                loop {
                    match node.recv(accepted.port).await {
                        Ok((channel, message)) => {
                            if let Err(e) = node.send(accepted.port, channel, &message) {
                                log::warn!("echo: {e}");
                            }
                        }
                        Err(e) => {
                            log::info!("connection {} closed: {e}", accepted.port);
                            break;
                        }
                    }
                }
            }
        }
    }
}
