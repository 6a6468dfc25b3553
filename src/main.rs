use anyhow::{Context, Result};
use clap::Parser;
use multiaddr::Multiaddr;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use kadnode::{
    transport::multiaddr_to_socketaddr, KademliaConfig, KademliaNode, Key,
};

#[derive(Parser, Debug)]
#[command(name = "kadnode", about = "A Kademlia DHT node")]
struct Args {
    /// Port to listen on, 0 lets the OS pick one
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// IP to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    ip: IpAddr,

    /// IP announced to other nodes, defaults to the listen IP
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// IP of the node to join through
    #[arg(long = "joinIP", requires = "join_port")]
    join_ip: Option<IpAddr>,

    /// Port of the node to join through
    #[arg(long = "joinPort", requires = "join_ip")]
    join_port: Option<u16>,

    /// Multiaddr of the node to join through, instead of --joinIP/--joinPort
    #[arg(long, conflicts_with_all = ["join_ip", "join_port"])]
    join: Option<Multiaddr>,

    /// Log protocol activity to stderr
    #[arg(long = "loggingEnabled")]
    logging_enabled: bool,
}

impl Args {
    fn bootstrap_addr(&self) -> Result<Option<SocketAddr>> {
        if let Some(addr) = &self.join {
            return Ok(Some(multiaddr_to_socketaddr(addr.clone())?));
        }

        Ok(self
            .join_ip
            .zip(self.join_port)
            .map(|(ip, port)| SocketAddr::new(ip, port)))
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.logging_enabled {
        init_logging();
    }

    let mut config = KademliaConfig::default();
    config
        .set_listen_addr(SocketAddr::new(args.ip, args.port))
        .set_advertise_ip(args.advertise_ip)
        .set_logging_enabled(args.logging_enabled);

    let (node, server) = KademliaNode::listen(config)
        .await
        .context("Failed to start listener")?;
    println!(
        ">> Node {} listening on {}",
        node.local_key(),
        node.local().to_multiaddr()
    );

    if let Some(bootstrap) = args.bootstrap_addr()? {
        let found = node
            .join(bootstrap)
            .await
            .with_context(|| format!("Failed to join the network through {bootstrap}"))?;
        println!(">> Joined through {bootstrap}, {} nodes found", found.len());
    }

    let mut reader = BufReader::new(stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = reader.next_line(), if stdin_open => match line {
                Ok(Some(line)) => run_command(&node, &line).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    eprintln!("> Failed to read stdin: {e}");
                    stdin_open = false;
                }
            }
        }
    }

    println!(">> Shutting down");
    server.shutdown().await;
    Ok(())
}

async fn run_command(node: &KademliaNode, line: &str) {
    let mut args = line.split_whitespace();

    match args.next() {
        Some("PUT") => {
            let value = args.collect::<Vec<_>>().join(" ").into_bytes();
            match node.put(value).await {
                Ok(key) => println!("> Stored under {key}"),
                Err(e) => println!("> Put failed: {e}"),
            }
        }
        Some("GET") => match args.next().map(str::parse::<Key>) {
            Some(Ok(key)) => match node.lookup_value(&key).await {
                Ok(value) => println!("> {key}: {}", String::from_utf8_lossy(&value)),
                Err(e) => println!("> Get {key} failed: {e}"),
            },
            Some(Err(e)) => println!("> {e}"),
            None => println!("> Usage: GET <key>"),
        },
        Some("FIND_NODE") => {
            let target = match args.next().map(str::parse::<Key>) {
                Some(Ok(key)) => key,
                Some(Err(e)) => return println!("> {e}"),
                None => Key::random(),
            };

            let nodes = node.lookup_nodes(&target).await;
            println!("> Found {} nodes closest to {target}", nodes.len());
            for node in nodes {
                println!("\t{node}");
            }
        }
        Some("PING") => match args.next().map(str::parse::<SocketAddr>) {
            Some(Ok(addr)) => match node.ping(addr).await {
                Ok(peer) => println!("> Pong from {peer}"),
                Err(e) => println!("> Ping failed: {e}"),
            },
            Some(Err(e)) => println!("> {e}"),
            None => println!("> Usage: PING <ip:port>"),
        },
        Some("COUNT") => println!("> {} known nodes", node.node_count().await),
        Some(other) => println!("> Unknown command {other}"),
        None => {}
    }
}
