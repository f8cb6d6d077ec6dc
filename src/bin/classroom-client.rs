//! # Classroom Session Terminal Client
//!
//! Joins a room and turns stdin lines into chat messages. Lines starting with `/` are
//! commands:
//!
//! - `/voice on|off`: start or stop the synthetic microphone
//! - `/board <image reference>`: overwrite the whiteboard
//! - `/gain <connection id> <value>`: set a peer's playback gain
//! - `/leave`: leave the room and exit
//!
//! Settings come from `client.toml` and `CLIENT__*` variables, see [`ClientConfig`].
//!
//! The terminal has no audio device access: the microphone is a synthetic [`ToneSource`]
//! and playback goes to [`NullBackend`], so incoming voice is decoded, gain-adjusted and
//! counted per peer but never heard. Embedders supply a real `PlaybackBackend`.

use anyhow::Result;
use classroom_session::audio::{NullBackend, ToneSource};
use classroom_session::client::{ClientConfig, ClientEvent, SessionClient, SessionHandle};
use classroom_session::protocol::ChatMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classroom_session=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::load()?;
    config.validate()?;
    info!(
        "Connecting to {} as '{}'",
        config.server_url, config.display_name
    );

    let source = ToneSource::new(config.sample_rate, config.frame_size);
    let (client, mut channels) =
        SessionClient::new(config, Box::new(source), Box::new(NullBackend));

    // The session loop holds non-Send audio state, so it stays on this thread
    LocalSet::new()
        .run_until(async move {
            let session = tokio::task::spawn_local(client.run());
            let handle = channels.handle.clone();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => match line? {
                        Some(line) => {
                            if !run_command(&handle, line.trim()).await {
                                break;
                            }
                        }
                        None => {
                            let _ = handle.leave().await;
                            break;
                        }
                    },
                    event = channels.events.recv() => match event {
                        Some(event) => {
                            let done = matches!(event, ClientEvent::Disconnected { .. } | ClientEvent::Left);
                            print_event(&event);
                            if done {
                                break;
                            }
                        }
                        None => break,
                    },
                    changed = channels.presentation.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = channels.presentation.borrow_and_update().clone();
                        if !state.speaking_connection_ids.is_empty() {
                            println!("~ speaking: {}", state.speaking_connection_ids.join(", "));
                        }
                    }
                }
            }

            drop(channels.handle);
            drop(handle);
            session.await??;
            Ok::<(), anyhow::Error>(())
        })
        .await
}

/// Returns `false` once the user asked to leave.
async fn run_command(handle: &SessionHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let result = match parts.next() {
        None => Ok(()),
        Some("/leave") => {
            if let Err(e) = handle.leave().await {
                warn!("Leave failed: {}", e);
            }
            return false;
        }
        Some("/voice") => match parts.next() {
            Some("on") => handle.start_voice().await,
            Some("off") => handle.stop_voice().await,
            _ => {
                println!("usage: /voice on|off");
                Ok(())
            }
        },
        Some("/board") => {
            let reference = parts.collect::<Vec<_>>().join(" ");
            handle.update_whiteboard(reference).await
        }
        Some("/gain") => match (parts.next(), parts.next().and_then(|g| g.parse::<f32>().ok())) {
            (Some(peer), Some(gain)) => handle.set_peer_gain(peer, gain).await.map(|applied| {
                println!("gain for {} set to {:.2}", peer, applied);
            }),
            _ => {
                println!("usage: /gain <connection id> <value>");
                Ok(())
            }
        },
        Some(command) if command.starts_with('/') => {
            println!("unknown command {}", command);
            Ok(())
        }
        Some(_) => handle.send_chat(line).await,
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

fn print_chat(message: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        message.sent_at.format("%H:%M:%S"),
        message.sender_display_name,
        message.text
    );
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Joined {
            connection_id,
            room,
            participants,
        } => {
            let names: Vec<&str> = participants.iter().map(|p| p.display_name.as_str()).collect();
            println!("* joined '{}' as {} with {}", room, connection_id, names.join(", "));
        }
        ClientEvent::ChatHistory(messages) => {
            for message in messages {
                print_chat(message);
            }
        }
        ClientEvent::ChatMessage(message) => {
            print_chat(message);
        }
        ClientEvent::ParticipantJoined(participant) => {
            println!("* {} joined ({})", participant.display_name, participant.connection_id);
        }
        ClientEvent::ParticipantLeft {
            connection_id,
            display_name,
        } => {
            println!("* {} left", display_name.as_deref().unwrap_or(connection_id));
        }
        ClientEvent::WhiteboardChanged {
            image_reference,
            updated_by,
        } => println!("* whiteboard is now {} (by {})", image_reference, updated_by),
        ClientEvent::SpeakingChanged { .. } => {}
        ClientEvent::ServerError { code, message } => println!("! server: {} ({})", message, code),
        ClientEvent::Error(e) => println!("! {}", e),
        ClientEvent::Reconnecting { attempt, delay } => {
            println!("* reconnecting (attempt {}) in {}ms", attempt, delay.as_millis())
        }
        ClientEvent::Disconnected { reason } => println!("* disconnected: {}", reason),
        ClientEvent::Left => println!("* left the room"),
    }
}
