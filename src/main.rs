use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshgate::{Delivery, Identity, InboundMessage, Middleware, NeighborSummary, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to listen on.
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(short, long, default_value_t = 30001)]
    port: u16,

    /// Address of an existing node to join through (HOST:PORT).
    #[arg(short, long, value_name = "ADDR")]
    seed: Option<String>,

    /// Fixed node identity (64 hex characters). Random if omitted.
    #[arg(long, value_name = "HEX")]
    id: Option<Identity>,

    /// Comma-separated identities to refuse connections with.
    #[arg(long, value_name = "HEX,HEX", value_delimiter = ',')]
    blacklist: Vec<Identity>,

    #[arg(long, default_value_t = 8)]
    max_hops: u8,

    /// Seconds to wait for a reply to `send`.
    #[arg(long, default_value_t = 10)]
    request_timeout: u64,
}

const HELP: &str = "\
Commands:
  help                   show this help
  peers                  list neighbors
  send <id> <message>    send a message and wait for the reply
  broadcast <message>    send a message to every node
  blacklist <id>         refuse future connections with <id>
  unblacklist <id>       allow connections with <id> again
  exit                   leave the network";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        identity: args.id,
        blacklist: args.blacklist.clone(),
        max_hops: args.max_hops,
        request_timeout: Duration::from_secs(args.request_timeout),
        ..NodeConfig::default()
    };
    let addr = format!("{}:{}", args.bind, args.port);
    let node = Node::bind_with_config(&addr, config)
        .await
        .with_context(|| format!("failed to start node on {addr}"))?;
    info!("Node identity: {}", node.identity());

    for blocked in &args.blacklist {
        info!("Blacklisted node: {}", blocked);
    }

    node.apply_middleware(Middleware::Connected(Arc::new(|neighbor: &NeighborSummary| {
        info!("Remote node connected: {}/{}", neighbor.addr, neighbor.identity);
        true
    })));
    node.apply_middleware(Middleware::MessageReceived(Arc::new(|message: &InboundMessage| {
        if message.delivery == Delivery::Broadcast {
            println!(
                "\nBroadcast from {}: {}",
                message.source,
                String::from_utf8_lossy(&message.data)
            );
        }
        true
    })));
    node.set_request_handler(|from, request| {
        println!("\nMessage from {}: {}", from, String::from_utf8_lossy(&request));
        b"Message received".to_vec()
    });

    if let Some(seed) = &args.seed {
        info!("Joining via {}", seed);
        node.join(seed).await.context("failed to join network")?;
    }

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read console input")? else {
                    break;
                };
                if !run_command(&node, line.trim()).await {
                    break;
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

/// Returns `false` when the console should exit.
async fn run_command(node: &Node, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "" => {}
        "help" => println!("{HELP}"),
        "exit" | "quit" => return false,
        "peers" => {
            let neighbors = node.neighbors();
            if neighbors.is_empty() {
                println!("No neighbors");
            }
            for neighbor in neighbors {
                println!(
                    "{}/{} ({:?}, {}s)",
                    neighbor.addr,
                    neighbor.identity,
                    neighbor.direction,
                    neighbor.connected_for.as_secs()
                );
            }
        }
        "send" => {
            let Some((target, message)) = rest.split_once(' ') else {
                println!("Usage: send <id> <message>");
                return true;
            };
            let Ok(target) = target.parse::<Identity>() else {
                println!("Invalid node id: {target}");
                return true;
            };
            match node.send_sync(target, message.trim().as_bytes().to_vec()).await {
                Ok(reply) => println!(
                    "Message sent. Reply from {}: {}",
                    reply.replier,
                    String::from_utf8_lossy(&reply.payload)
                ),
                Err(e) if e.is_timeout() => println!("No reply: {e}"),
                Err(e) => println!("Send failed: {e}"),
            }
        }
        "broadcast" => {
            if rest.is_empty() {
                println!("Usage: broadcast <message>");
                return true;
            }
            match node.broadcast(rest.as_bytes().to_vec()) {
                Ok(_) => println!("Broadcast sent"),
                Err(e) => warn!(error = %e, "broadcast failed"),
            }
        }
        "blacklist" | "unblacklist" => {
            let Ok(identity) = rest.parse::<Identity>() else {
                println!("Invalid node id: {rest}");
                return true;
            };
            if command == "blacklist" {
                node.add_blacklist_entry(identity);
                println!("Blacklisted {identity}");
            } else if node.remove_blacklist_entry(&identity) {
                println!("Removed {identity} from blacklist");
            } else {
                println!("{identity} was not blacklisted");
            }
        }
        other => println!("Unknown command: {other} (try `help`)"),
    }
    true
}
