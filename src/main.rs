use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use p2p_rtc::config::DEFAULT_LOG_FILTER;
use p2p_rtc::network::{Body, FilePayload};
use p2p_rtc::{
    AppConfig, ChannelCallbacks, Contact, FileAttachment, IceCandidate, P2PResult, PeerId,
    PeerSessionManager, ProfileStore, SessionDescription, SessionEvent, SqliteStore,
    WebRtcTransport,
};

type Manager = PeerSessionManager<ChannelCallbacks>;

const DOWNLOADS_DIR: &str = "downloads";

fn print_usage(program: &str) {
    println!("P2P WebRTC Messenger");
    println!("Usage: {} [--name NAME] [--dir PATH]", program);
    println!("  --name NAME: Display name stored in the local profile");
    println!("  --dir PATH:  Directory for the profile database and downloads");
    println!("  --help, -h:  Show this help message");
    println!();
    print_commands();
}

fn print_commands() {
    println!("Commands (signaling payloads are single-line JSON):");
    println!("  /offer PEER                 create an offer for PEER");
    println!("  /accept PEER OFFER_JSON     answer an offer received from PEER");
    println!("  /answer PEER ANSWER_JSON    apply the answer PEER sent back");
    println!("  /candidate PEER CAND_JSON   add a candidate PEER sent");
    println!("  /msg PEER TEXT              send a text message");
    println!("  /file PEER PATH             send a file");
    println!("  /peers                      list connected peers");
    println!("  /contacts                   list known contacts");
    println!("  /close PEER                 close the session with PEER");
    println!("  /quit                       leave");
}

// Main function
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("p2p-rtc");

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage(program);
        return Ok(());
    }

    let mut config = AppConfig::from_env()?;
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--name" => {
                config.display_name = rest.next().cloned().ok_or("--name needs a value")?;
            }
            "--dir" => {
                config.config_dir = rest.next().map(PathBuf::from).ok_or("--dir needs a value")?;
            }
            other => return Err(format!("Unknown argument: {}", other).into()),
        }
    }
    config.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = SqliteStore::in_dir(&config.config_dir)?;
    let (callbacks, mut session_events) = ChannelCallbacks::new();
    let mut manager = PeerSessionManager::new(WebRtcTransport::new()?, config.session.clone(), callbacks)?;

    let identity = match store.load_profile()? {
        Some(profile) => manager.initialize_from_profile(&profile).await?,
        None => {
            let identity = manager.initialize().await?;
            store.save_profile(&manager.export_profile(config.display_name.clone())?)?;
            identity
        }
    };
    info!(identity = %identity, dir = %config.config_dir.display(), "Profile ready");
    println!("You are {} ({})", config.display_name, identity);
    print_commands();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match handle_command(&mut manager, &store, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("Error: {}", e),
                }
            }
            Some(event) = manager.next_event() => {
                manager.handle_event(event).await;
            }
            Some(event) = session_events.recv() => {
                report(&manager, &store, &config.config_dir, event).await;
            }
        }
    }

    // Cleanup
    manager.disconnect().await;
    Ok(())
}

/// Run one command line. Returns false when the user wants to quit.
async fn handle_command(manager: &mut Manager, store: &SqliteStore, line: &str) -> P2PResult<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let peer = parts.next().map(PeerId::from);
    let rest = parts.next().unwrap_or_default();

    match (command, peer) {
        ("/quit", _) => return Ok(false),
        ("/peers", _) => {
            let peers = manager.get_connected_peers();
            if peers.is_empty() {
                println!("No connected peers");
            }
            for peer in peers {
                let fingerprint = manager.key_fingerprint(&peer).unwrap_or_else(|| "no key yet".to_string());
                println!("  {} [{}]", peer, fingerprint);
            }
        }
        ("/contacts", _) => {
            for contact in store.load_contacts()? {
                println!(
                    "  {} {} last seen {}",
                    contact.peer_id,
                    contact.display_name.as_deref().unwrap_or("-"),
                    contact.last_seen.format("%Y-%m-%d %H:%M")
                );
            }
        }
        ("/offer", Some(peer)) => {
            let offer = manager.connect_to_peer(&peer).await?;
            println!("Send this offer to {}:", peer);
            println!("{}", offer.to_json()?);
        }
        ("/accept", Some(peer)) => {
            let offer = SessionDescription::from_json(rest)?;
            let answer = manager.handle_peer_offer(&peer, offer).await?;
            println!("Send this answer to {}:", peer);
            println!("{}", answer.to_json()?);
        }
        ("/answer", Some(peer)) => {
            manager
                .handle_peer_answer(&peer, SessionDescription::from_json(rest)?)
                .await?;
            println!("Answer applied; waiting for {}", peer);
        }
        ("/candidate", Some(peer)) => {
            manager
                .add_ice_candidate(&peer, IceCandidate::from_json(rest)?)
                .await?;
        }
        ("/msg", Some(peer)) => {
            if !manager.send_text_message(&peer, rest).await? {
                println!("Not connected to {}", peer);
            }
        }
        ("/file", Some(peer)) => {
            let attachment = FileAttachment::from_path(rest).await?;
            if manager.send_file(&peer, &attachment).await? {
                println!("Sent {} ({} bytes)", attachment.name, attachment.size());
            } else {
                println!("Not connected to {}", peer);
            }
        }
        ("/close", Some(peer)) => {
            manager.close_peer(&peer).await?;
            println!("Closed session with {}", peer);
        }
        _ => print_commands(),
    }
    Ok(true)
}

/// Print a session event and keep the contact ledger current.
async fn report(manager: &Manager, store: &SqliteStore, config_dir: &std::path::Path, event: SessionEvent) {
    match event {
        SessionEvent::Connected(peer) => {
            println!("*** Connected to {}", peer);
            remember(manager, store, &peer);
        }
        SessionEvent::Disconnected(peer) => println!("*** {} disconnected", peer),
        SessionEvent::Message { peer, envelope } => {
            remember(manager, store, &peer);
            match &envelope.body {
                Body::Text(_) => {
                    println!("<{}> {}", peer, envelope.text_content().unwrap_or("<sealed>"));
                }
                Body::Image(file) | Body::File(file) => {
                    match save_attachment(config_dir, file).await {
                        Ok(path) => println!("<{}> sent {} -> {}", peer, file.name, path.display()),
                        Err(e) => println!("<{}> sent {} but it could not be saved: {}", peer, file.name, e),
                    }
                }
                Body::KeyExchange(_) => {}
            }
        }
        SessionEvent::IceCandidate { peer, candidate } => {
            if let Ok(json) = candidate.to_json() {
                println!("/candidate {} {}", peer, json);
            }
        }
        SessionEvent::Error(e) => println!("Error: {}", e),
    }
}

fn remember(manager: &Manager, store: &SqliteStore, peer: &PeerId) {
    let mut contact = Contact::seen_now(peer.as_str());
    contact.public_key = manager.peer_public_key(peer).map(str::to_string);
    if let Err(e) = store.record_contact(&contact) {
        warn!(peer = %peer, "Failed to record contact: {}", e);
    }
}

async fn save_attachment(config_dir: &std::path::Path, file: &FilePayload) -> P2PResult<PathBuf> {
    let bytes = file.decode_data()?;
    let dir = config_dir.join(DOWNLOADS_DIR);
    tokio::fs::create_dir_all(&dir).await?;

    // Only the final path component of a remote-chosen name is used.
    let name = std::path::Path::new(&file.name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "attachment".to_string());
    let path = dir.join(name);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}
