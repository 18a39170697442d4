// rendezvous-cli — operator console for the signaling relay
//
// Drives a local sled-backed gateway: register identities, walk the
// connection request lifecycle, and relay encrypted handshake fragments.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rendezvous_core::store::{SledStorage, StorageBackend};
use rendezvous_core::{
    Directory, DirectoryStore, RelayConfig, RelayGateway, ResolveAction, SignalKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rdv")]
#[command(about = "Rendezvous — content-blind WebRTC signaling relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage directory identities
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Manage connection requests
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },
    /// List or sever accepted connections
    Connection {
        #[command(subcommand)]
        action: ConnectionAction,
    },
    /// Push, poll or clear signaling messages
    Signal {
        #[command(subcommand)]
        action: SignalAction,
    },
    /// Show configured STUN/TURN servers
    Ice,
    /// Run the periodic expiry sweeper until interrupted
    Serve {
        /// Sweep interval in seconds
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },
    /// Show mailbox statistics
    Stats,
}

#[derive(Subcommand)]
enum UserAction {
    /// Register an identity with its public key material
    Add { username: String, public_key: String },
    /// Search identities by username prefix
    Search {
        prefix: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one identity
    Show { username: String },
    /// Flip the presence flag
    Presence {
        username: String,
        #[arg(long)]
        online: bool,
    },
}

#[derive(Subcommand)]
enum RequestAction {
    /// Submit a connection request
    Send { from: String, to: String },
    /// List pending incoming requests
    Pending { user: String },
    /// Accept or decline a pending request
    Respond {
        user: String,
        request_id: String,
        /// "accept" or "decline"
        action: String,
    },
}

#[derive(Subcommand)]
enum ConnectionAction {
    List { user: String },
    Remove { user: String, peer: String },
}

#[derive(Subcommand)]
enum SignalAction {
    /// Relay an encrypted handshake fragment
    Push {
        from: String,
        to: String,
        /// "offer", "answer" or "ice"
        kind: String,
        /// Opaque payload (already encrypted by the client)
        payload: String,
    },
    /// Drain the user's mailbox
    Poll {
        user: String,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Emit the drained entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop every in-flight signal the user sent or received
    Clear { user: String },
}

struct Node {
    gateway: RelayGateway,
    directory: DirectoryStore,
}

fn open_node(data_dir: Option<PathBuf>) -> Result<Node> {
    let base = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("no platform data directory")?
            .join("rendezvous"),
    };
    std::fs::create_dir_all(&base).with_context(|| format!("creating {}", base.display()))?;

    let store_path = base.join("store");
    let backend: Arc<dyn StorageBackend> = Arc::new(
        SledStorage::new(store_path.to_str().context("non-utf8 data dir")?)
            .map_err(anyhow::Error::msg)
            .context("opening storage")?,
    );
    let directory = DirectoryStore::new(backend.clone());
    let gateway = RelayGateway::new(
        Arc::new(directory.clone()),
        backend,
        RelayConfig::default(),
    );
    Ok(Node { gateway, directory })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let node = open_node(cli.data_dir)?;

    match cli.command {
        Commands::User { action } => cmd_user(&node, action),
        Commands::Request { action } => cmd_request(&node, action),
        Commands::Connection { action } => cmd_connection(&node, action),
        Commands::Signal { action } => cmd_signal(&node, action),
        Commands::Ice => cmd_ice(&node),
        Commands::Serve { interval } => cmd_serve(&node, interval).await,
        Commands::Stats => cmd_stats(&node),
    }
}

fn cmd_user(node: &Node, action: UserAction) -> Result<()> {
    match action {
        UserAction::Add { username, public_key } => {
            let record = node.directory.register(&username, &public_key)?;
            println!("{} Registered {}", "✓".green(), record.username.bright_cyan());
        }
        UserAction::Search { prefix, limit } => {
            // No authenticated caller here, so search the directory itself
            // rather than the gateway's exclude-the-caller view.
            let matches = node.directory.search_by_prefix(&prefix, limit)?;
            if matches.is_empty() {
                println!("{}", "No matching users.".dimmed());
            } else {
                for record in matches {
                    let presence = if record.is_online {
                        "online".bright_green()
                    } else {
                        "offline".dimmed()
                    };
                    println!(
                        "  {} {} ({})",
                        "•".bright_green(),
                        record.username.bright_cyan(),
                        presence
                    );
                }
            }
        }
        UserAction::Show { username } => {
            let record = node.gateway.lookup_user(&username)?;
            println!("{}", "Identity".bold());
            println!("  Username:   {}", record.username.bright_cyan());
            println!("  Public Key: {}", record.public_key.bright_yellow());
            println!("  Online:     {}", record.is_online);
        }
        UserAction::Presence { username, online } => {
            node.directory.set_presence(&username, online)?;
            println!("{} Presence updated", "✓".green());
        }
    }
    Ok(())
}

fn cmd_request(node: &Node, action: RequestAction) -> Result<()> {
    match action {
        RequestAction::Send { from, to } => {
            let request = node.gateway.submit_request(&from, &to)?;
            println!("{} Request {} is pending", "✓".green(), request.id.bright_cyan());
        }
        RequestAction::Pending { user } => {
            let pending = node.gateway.pending_requests(&user)?;
            if pending.is_empty() {
                println!("{}", "No pending requests.".dimmed());
            } else {
                println!("{} ({} total)", "Pending Requests".bold(), pending.len());
                for request in pending {
                    println!(
                        "  {} from {} ({})",
                        "•".bright_green(),
                        request.requester.bright_cyan(),
                        request.id.dimmed()
                    );
                }
            }
        }
        RequestAction::Respond { user, request_id, action } => {
            let action: ResolveAction = action.parse()?;
            let resolved = node.gateway.resolve_request(&user, &request_id, action)?;
            println!(
                "{} Request from {} is now {:?}",
                "✓".green(),
                resolved.requester.bright_cyan(),
                resolved.status
            );
        }
    }
    Ok(())
}

fn cmd_connection(node: &Node, action: ConnectionAction) -> Result<()> {
    match action {
        ConnectionAction::List { user } => {
            let connections = node.gateway.connections(&user)?;
            if connections.is_empty() {
                println!("{}", "No connections yet.".dimmed());
            } else {
                println!("{} ({} total)", "Connections".bold(), connections.len());
                for connection in connections {
                    let presence = if connection.is_online {
                        "online".bright_green()
                    } else {
                        "offline".dimmed()
                    };
                    println!(
                        "  {} {} ({})",
                        "•".bright_green(),
                        connection.peer.bright_cyan(),
                        presence
                    );
                }
            }
        }
        ConnectionAction::Remove { user, peer } => {
            if node.gateway.sever(&user, &peer)? {
                println!("{} Connection removed", "✓".green());
            } else {
                println!("{}", "No such connection.".dimmed());
            }
        }
    }
    Ok(())
}

fn cmd_signal(node: &Node, action: SignalAction) -> Result<()> {
    match action {
        SignalAction::Push { from, to, kind, payload } => {
            let kind: SignalKind = kind.parse()?;
            let entry = node
                .gateway
                .push_signal(&from, &to, kind, payload.into_bytes())?;
            println!(
                "{} Signal {} queued for {}",
                "✓".green(),
                entry.id.dimmed(),
                entry.recipient.bright_cyan()
            );
        }
        SignalAction::Poll { user, limit, json } => {
            let entries = node.gateway.drain_mailbox(&user, limit);
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("{}", "Mailbox empty.".dimmed());
            } else {
                println!("{} ({} total)", "Signals".bold(), entries.len());
                for entry in entries {
                    println!(
                        "  {} {:?} from {} ({} bytes)",
                        "•".bright_green(),
                        entry.kind,
                        entry.sender.bright_cyan(),
                        entry.payload.len()
                    );
                }
            }
        }
        SignalAction::Clear { user } => {
            let removed = node.gateway.clear_mailbox(&user);
            println!("{} Removed {} signal(s)", "✓".green(), removed);
        }
    }
    Ok(())
}

fn cmd_ice(node: &Node) -> Result<()> {
    let ice = node.gateway.ice_servers();
    println!("{}", "ICE Servers".bold());
    for stun in ice.stun_servers {
        println!("  {} {}", "•".bright_green(), stun);
    }
    for turn in ice.turn_servers {
        println!("  {} {} (user: {})", "•".bright_green(), turn.urls, turn.username);
    }
    Ok(())
}

async fn cmd_serve(node: &Node, interval: u64) -> Result<()> {
    node.gateway.start()?;
    println!(
        "{} Sweeping expired signals every {}s (ctrl-c to stop)",
        "✓".green(),
        interval
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let swept = node.gateway.sweep_expired();
                if swept > 0 {
                    tracing::info!("Swept {} expired signal(s)", swept);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    node.gateway.stop();
    println!("{}", "Stopped.".dimmed());
    Ok(())
}

fn cmd_stats(node: &Node) -> Result<()> {
    let stats = node.gateway.mailbox_stats();
    println!("{}", "Mailbox Statistics".bold());
    println!("  Stored:    {}", stats.entries_stored);
    println!("  Delivered: {}", stats.entries_delivered);
    println!("  Expired:   {}", stats.entries_expired);
    Ok(())
}
