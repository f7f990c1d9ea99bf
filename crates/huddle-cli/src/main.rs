//! Huddle CLI
//!
//! Thin terminal frontend over huddle-core: join a room, chat, edit the
//! shared document, and drive the media mesh.
//!
//! ## Usage
//!
//! ```bash
//! # Join a room on the in-process relay (single machine)
//! huddle join my-room --name alice
//!
//! # Host a room over the gossip relay and print a shareable ticket
//! huddle join my-room --name alice --relay gossip --share
//!
//! # Join via a ticket from another machine
//! huddle join my-room --name bob --relay gossip --ticket huddle-room:...
//!
//! # Inspect a ticket
//! huddle ticket huddle-room:...
//! ```
//!
//! Inside a room, plain lines are chat messages; `/doc <text>` sets the
//! shared document, `/peers` lists stream records, `/start`, `/stop`,
//! `/cam`, `/mic` drive the mesh, and `/quit` leaves.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use huddle_core::{
    GossipNet, LoopbackTransport, MemoryHub, MeshEvent, PeerTransport, Room, RoomEngine, RoomId,
    RoomTicket,
};

/// Huddle - shared rooms with a live document, chat, and a peer mesh
#[derive(Parser)]
#[command(name = "huddle")]
#[command(version = "0.1.0")]
#[command(about = "Shared rooms: live document, chat, and a peer media mesh")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and interact from the terminal
    Join {
        /// Room id
        room: String,

        /// Display name (blank becomes a generated guest name)
        #[arg(short, long, default_value = "")]
        name: String,

        /// Relay substrate
        #[arg(long, value_enum, default_value = "memory")]
        relay: RelayKind,

        /// Bootstrap ticket for the gossip relay
        #[arg(long)]
        ticket: Option<String>,

        /// Print a shareable ticket for this room (gossip relay only)
        #[arg(long)]
        share: bool,

        /// Start the media mesh immediately after joining
        #[arg(long)]
        media: bool,
    },

    /// Decode and inspect a room ticket
    Ticket {
        /// Encoded huddle-room: ticket
        ticket: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RelayKind {
    /// In-process relay (participants on this machine share state)
    Memory,
    /// iroh-gossip relay (one topic per room, bootstrapped by ticket)
    Gossip,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Join {
            room,
            name,
            relay,
            ticket,
            share,
            media,
        } => join(room, name, relay, ticket, share, media).await,
        Commands::Ticket { ticket } => inspect_ticket(&ticket),
    }
}

fn inspect_ticket(encoded: &str) -> Result<()> {
    let ticket = RoomTicket::decode(encoded)?;
    println!("room: {}", ticket.room_id);
    for peer in &ticket.bootstrap {
        println!(
            "bootstrap: {} (relay: {}, {} direct address(es))",
            node_short(&peer.node_id),
            peer.relay_url.as_deref().unwrap_or("none"),
            peer.direct_addresses.len()
        );
    }
    Ok(())
}

fn node_short(node_id: &[u8; 32]) -> String {
    let mut hex = String::new();
    for byte in node_id.iter().take(4) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("{}…", hex)
}

async fn join(
    room_id: String,
    name: String,
    relay: RelayKind,
    ticket: Option<String>,
    share: bool,
    media: bool,
) -> Result<()> {
    let room_id = RoomId::new(room_id);
    let transport = Arc::new(LoopbackTransport::new());

    match relay {
        RelayKind::Memory => {
            if ticket.is_some() || share {
                anyhow::bail!("tickets are only meaningful with --relay gossip");
            }
            let engine = RoomEngine::new(Arc::new(MemoryHub::new()), transport);
            let room = engine.join(room_id, &name).await?;
            run_room(room, media).await
        }
        RelayKind::Gossip => {
            let net = Arc::new(GossipNet::bind().await?);
            if let Some(encoded) = ticket {
                let ticket = RoomTicket::decode(&encoded)?;
                if ticket.room() != room_id {
                    anyhow::bail!("ticket is for room {}, not {}", ticket.room_id, room_id);
                }
                net.register_ticket(&ticket)?;
            }
            if share {
                println!("share this ticket:\n{}", net.ticket(&room_id).encode()?);
            }
            let engine = RoomEngine::new(net, transport);
            let room = engine.join(room_id, &name).await?;
            run_room(room, media).await
        }
    }
}

async fn run_room<T: PeerTransport>(room: Room<T>, media: bool) -> Result<()> {
    println!(
        "joined {} as {} ({})",
        room.id(),
        room.participant().display_name,
        room.participant().id
    );

    let doc = room.document(String::new());
    let chat = room.chat();

    // Print chat entries as they arrive, oldest first
    let mut chat_watch = chat.watch();
    let chat_task = tokio::spawn(async move {
        let mut printed: HashSet<String> = HashSet::new();
        loop {
            {
                let entries = chat_watch.borrow().clone();
                for entry in entries {
                    if printed.insert(entry.id.clone()) {
                        println!("[{}] {}", entry.sender_name, entry.text);
                    }
                }
            }
            if chat_watch.changed().await.is_err() {
                break;
            }
        }
    });

    // Narrate mesh membership changes
    let mut mesh_events = room.mesh().events();
    let events_task = tokio::spawn(async move {
        while let Ok(event) = mesh_events.recv().await {
            match event {
                MeshEvent::PeerDiscovered(peer) => println!("* discovered {}", peer.short()),
                MeshEvent::PeerConnected(peer) => println!("* connected {}", peer.short()),
                MeshEvent::PeerClosed(peer) => println!("* disconnected {}", peer.short()),
                MeshEvent::PeerFailed { participant, reason } => {
                    println!("* connection to {} failed: {}", participant.short(), reason)
                }
            }
        }
    });

    if media {
        room.mesh().start().await?;
        println!("media mesh started");
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ') {
            Some(("/doc", text)) => {
                doc.set(&text.to_string());
                println!("document updated ({} chars)", text.len());
            }
            _ => match line {
                "/doc" => println!("document:\n{}", doc.current()),
                "/peers" => {
                    for record in room.mesh().streams().borrow().iter() {
                        let kind = if record.is_local() { "local" } else { "remote" };
                        println!("{}  {} ({})", record.label, record.participant, kind);
                    }
                }
                "/start" => match room.mesh().start().await {
                    Ok(()) => println!("media mesh started"),
                    Err(e) => println!("could not start media: {}", e),
                },
                "/stop" => {
                    room.mesh().stop().await;
                    println!("media mesh stopped");
                }
                "/cam" => {
                    let on = room.mesh().toggle_camera().await;
                    println!("camera {}", if on { "on" } else { "off" });
                }
                "/mic" => {
                    let on = room.mesh().toggle_microphone().await;
                    println!("microphone {}", if on { "on" } else { "off" });
                }
                "/quit" => break,
                _ => {
                    chat.send(line);
                }
            },
        }
    }

    chat_task.abort();
    events_task.abort();
    room.leave().await;
    println!("left the room");
    Ok(())
}
