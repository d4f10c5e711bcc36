use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use voice_mesh::audio::{AudioPlayback, CpalMicrophone};
use voice_mesh::rtc::WebrtcTransportFactory;
use voice_mesh::signaling::WebSocketConnector;
use voice_mesh::{Backends, CallConfig, CallEvent, CallSession, ParticipantId, SessionState};
use webrtc::track::track_remote::TrackRemote;

/// Join a room and talk to everyone in it.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Room code to join
    room: String,

    /// Relay WebSocket URL (overrides VOICE_MESH_RELAY_URL)
    #[arg(long)]
    relay_url: Option<String>,

    /// Seconds a peer may take to finish negotiating
    #[arg(long)]
    negotiation_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CallConfig::from_env();
    if let Some(url) = args.relay_url {
        config.relay_url = url;
    }
    if let Some(secs) = args.negotiation_timeout {
        config.negotiation_timeout = std::time::Duration::from_secs(secs);
    }

    let backends = Backends {
        media: Arc::new(CpalMicrophone),
        relay: Arc::new(WebSocketConnector),
        transports: Arc::new(WebrtcTransportFactory::new()?),
    };
    let (session, mut events) = CallSession::spawn(config, backends);

    session.join(&args.room).await?;
    println!("Room Code: {}", args.room);

    let mut playbacks: HashMap<ParticipantId, AudioPlayback> = HashMap::new();
    let mut joined = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, leaving");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    CallEvent::StateChanged(SessionState::Joined) => {
                        joined = true;
                        println!("Connected! Start talking.");
                    }
                    CallEvent::StateChanged(SessionState::NotJoined) if joined => break,
                    CallEvent::StateChanged(_) => {}
                    CallEvent::RemoteStream { participant, stream } => {
                        let Some(track) = stream.media::<TrackRemote>() else {
                            log::warn!("Stream from {} is not playable", participant);
                            continue;
                        };
                        match AudioPlayback::start(track).await {
                            Ok(playback) => {
                                playbacks.insert(participant, playback);
                            }
                            Err(e) => log::error!("Cannot play audio from {}: {}", participant, e),
                        }
                    }
                    CallEvent::RemoteStreamRemoved(participant) => {
                        playbacks.remove(&participant);
                    }
                    CallEvent::PresenceCount(count) => println!("Users in call: {}", count),
                    CallEvent::RosterChanged(roster) => {
                        let names: Vec<&str> = roster.iter().map(|id| id.as_str()).collect();
                        println!("Members: {}", names.join(", "));
                    }
                    CallEvent::PeerConnectionState { participant, state } => {
                        log::info!("{} is {}", participant, state);
                    }
                    CallEvent::Error(e) if e.is_fatal() => {
                        log::error!("{}", e);
                        break;
                    }
                    CallEvent::Error(e) => log::warn!("{}", e),
                }
            }
        }
    }

    playbacks.clear();
    session.leave().await;
    session.shutdown().await;
    Ok(())
}
