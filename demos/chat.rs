use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use hopnet::addr::NetworkAddress;
use hopnet::config::StackConfig;
use hopnet::medium::udp::UdpMedium;
use hopnet::stack::Stack;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{error, info, Level};

/// Two-way chat over datagrams. Start one process per node, e.g. for a chain A - B - C:
///
/// ```text
/// chat 127.0.0.1:7001 --neighbor 127.0.0.1:7002 --peer 127.0.0.1:7003
/// chat 127.0.0.1:7002 --neighbor 127.0.0.1:7001 --neighbor 127.0.0.1:7003
/// chat 127.0.0.1:7003 --neighbor 127.0.0.1:7002 --peer 127.0.0.1:7001
/// ```
#[derive(Parser)]
struct Args {
    local_address: String,

    #[clap(long)]
    neighbor: Vec<String>,

    /// the node to chat with; a relay-only node has none
    #[clap(long)]
    peer: Option<String>,

    #[clap(long, default_value_t = 42)]
    port: u16,

    #[clap(long, default_value_t = 0.0)]
    loss_rate: f64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let local_addr: SocketAddrV4 = args.local_address.parse()?;
    let mut neighbors = Vec::new();
    for s in args.neighbor {
        let neighbor: SocketAddrV4 = s.parse()?;
        neighbors.push(NetworkAddress::from(neighbor));
    }
    if neighbors.is_empty() {
        return Err(anyhow!("missing neighbors"));
    }

    let medium = Arc::new(UdpMedium::bind(local_addr, neighbors, args.loss_rate).await?);
    let stack = Arc::new(Stack::new(medium.clone(), StackConfig::default())?);

    let peer = match args.peer {
        Some(s) => NetworkAddress::from(s.parse::<SocketAddrV4>()?),
        None => {
            info!("no peer - relaying only");
            medium.recv_loop(stack).await;
            return Ok(());
        }
    };

    select! {
        _ = medium.recv_loop(stack.clone()) => { Ok(()) }
        result = chat(stack, peer, args.port) => { result }
    }
}

async fn chat(stack: Arc<Stack>, peer: NetworkAddress, port_number: u16) -> anyhow::Result<()> {
    let port = stack.create_unbound_port(port_number).await?;
    let target = stack.create_bound_port(peer, port_number).await?;
    info!("chatting with {} - type a line to send it", peer);

    let receiver = {
        let stack = stack.clone();
        let port = port.clone();
        tokio::spawn(async move {
            loop {
                match stack.receive_datagram(&port).await {
                    Ok(datagram) => {
                        println!("[{}] {}", datagram.source_addr, String::from_utf8_lossy(&datagram.payload));
                        stack.destroy_bound_port(datagram.reply_port).await;
                    }
                    Err(e) => {
                        info!("stopped receiving: {}", e);
                        return;
                    }
                }
            }
        })
    };

    // longer lines go out as several datagrams
    let max_message_len = stack.config().max_datagram_payload();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        for message in line.as_bytes().chunks(max_message_len) {
            if let Err(e) = stack.send_datagram(&port, &target, message).await {
                error!("could not send message: {}", e);
            }
        }
    }

    stack.shutdown().await;
    receiver.await?;
    Ok(())
}
