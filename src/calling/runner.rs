//! `call` and `listen` commands: wire the call core to the live server and
//! print what happens.
//!
//! While running, one-letter commands on stdin drive the call:
//! `a` accept, `r` reject, `m` mute, `c` camera, `h` hang up.

use std::fmt;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use super::controller::{CallController, CallEvent, CallTarget};
use super::engine::NegotiationEngine;
use super::error::CallError;
use super::media::{MediaAcquisition, SystemDevices};
use super::sdp_peer::SdpPeerFactory;
use super::{CallPhase, MediaKind};
use crate::api::client::ApiClient;
use crate::config::Config;
use crate::signaling::websocket::{SocketIoTransport, TransportSettings};
use crate::signaling::{ListenerId, SignalTransport};

const CONNECT_WAIT: Duration = Duration::from_secs(10);

struct Services {
    config: Config,
    api: Arc<ApiClient>,
    controller: CallController,
    media: Arc<MediaAcquisition>,
    transport: SocketIoTransport,
    transport_task: tokio::task::JoinHandle<()>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    listener: ListenerId,
}

impl Services {
    async fn start() -> Result<Self> {
        let config = Config::load()?;
        let token = config.valid_token()?;
        let api = Arc::new(ApiClient::from_config(&config)?);

        let transport = SocketIoTransport::new();
        let transport_task = transport.spawn(TransportSettings {
            server_url: config.server_url()?,
            token,
        });

        let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
        while !transport.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                transport.shutdown();
                bail!("Could not connect to the signaling server");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let signal: Arc<dyn SignalTransport> = Arc::new(transport.clone());
        let engine = NegotiationEngine::new(
            signal.clone(),
            Arc::new(SdpPeerFactory::new(config.call.peer_settings())),
            config.call.engine_settings(),
        );
        let media = Arc::new(MediaAcquisition::new(Arc::new(SystemDevices::new(
            config.call.camera.clone(),
        ))));
        let controller = CallController::new(
            signal,
            engine,
            media.clone(),
            api.clone(),
            config.call.call_settings(),
        );

        let (tx, events) = mpsc::unbounded_channel();
        let listener = controller.subscribe(Arc::new(move |ev: &CallEvent| {
            let _ = tx.send(ev.clone());
        }));
        controller.attach();

        Ok(Self {
            config,
            api,
            controller,
            media,
            transport,
            transport_task,
            events,
            listener,
        })
    }

    async fn stop(self) {
        hang_up(&self.controller);
        self.controller.unsubscribe(self.listener);
        self.controller.detach();
        let leaked = self.media.live_tracks();
        if !leaked.is_empty() {
            tracing::warn!("{} capture track(s) still open after hang-up", leaked.len());
            for t in &leaked {
                t.stop();
            }
        }
        self.transport.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.transport_task).await;
    }
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::PhaseChanged { phase, session } => match session {
            Some(s) => println!("[{}] {} ({})", phase, s.conversation_id, s.media),
            None => println!("[{}]", phase),
        },
        CallEvent::IncomingCall { session, caller } => println!(
            "Incoming {} call from {} in {}",
            session.media, caller.name, session.conversation_id
        ),
        CallEvent::CallerProfile(profile) => println!("Caller: {} ({})", profile.name, profile.id),
        CallEvent::RemoteMedia(Some(stream)) => {
            let status = |kind| {
                if stream.has_active(kind) {
                    "on"
                } else if stream.has_kind(kind) {
                    "off"
                } else {
                    "none"
                }
            };
            println!(
                "Remote media: audio {}, video {}",
                status(MediaKind::Audio),
                status(MediaKind::Video)
            );
        }
        CallEvent::RemoteMedia(None) => println!("Remote media: none"),
        CallEvent::Notice(notice) => println!("Notice: {:?}", notice),
    }
}

/// A command typed while the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Accept,
    Reject,
    Mute,
    Camera,
    HangUp,
}

impl Control {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "a" | "accept" => Some(Control::Accept),
            "r" | "reject" => Some(Control::Reject),
            "m" | "mute" => Some(Control::Mute),
            "c" | "camera" => Some(Control::Camera),
            "h" | "hangup" => Some(Control::HangUp),
            _ => None,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Control::Accept => "accept",
            Control::Reject => "reject",
            Control::Mute => "mute",
            Control::Camera => "camera",
            Control::HangUp => "hang up",
        };
        f.write_str(name)
    }
}

/// Read controls from stdin on a plain thread, so a pending read never
/// holds up runtime shutdown.
fn spawn_controls() -> mpsc::UnboundedReceiver<Control> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match Control::parse(&line) {
                Some(control) => {
                    if tx.send(control).is_err() {
                        break;
                    }
                }
                None => eprintln!(
                    "Unknown command {:?} (a=accept r=reject m=mute c=camera h=hang up)",
                    line.trim()
                ),
            }
        }
    });
    rx
}

/// Withdraws a call still inviting, otherwise ends it.
fn hang_up(controller: &CallController) {
    if controller.phase() == CallPhase::Inviting {
        controller.cancel_outgoing_call();
    } else {
        controller.end_active_call();
    }
}

async fn apply(controller: &CallController, control: Control) {
    let outcome: Result<&str, CallError> = match control {
        Control::Accept => controller.accept_incoming_call().await.map(|()| "Accepted"),
        Control::Reject if controller.phase() == CallPhase::Ringing => {
            controller.reject_incoming_call();
            Ok("Rejected")
        }
        Control::Reject => Err(CallError::NotRinging),
        Control::Mute => controller
            .toggle_mute()
            .map(|muted| if muted { "Microphone muted" } else { "Microphone on" }),
        Control::Camera => controller
            .toggle_camera()
            .await
            .map(|on| if on { "Camera on" } else { "Camera off" }),
        Control::HangUp => {
            hang_up(controller);
            Ok("Hung up")
        }
    };
    match outcome {
        Ok(message) => println!("{}", message),
        Err(e) => println!("Cannot {}: {}", control, e),
    }
}

/// Call the other participant of a conversation and keep the call up for
/// `duration` seconds after it connects.
pub async fn run_call(
    conversation_id: &str,
    to: Option<String>,
    audio_only: bool,
    duration: u64,
) -> Result<()> {
    let mut services = Services::start().await?;

    let peer_user_id = match to {
        Some(id) => id,
        None => {
            let me = services.config.user_id()?;
            let conversation = services
                .api
                .conversation(conversation_id)
                .await
                .context("Failed to resolve conversation")?;
            match conversation.other_participant(&me) {
                Some(p) => p.id.clone(),
                None => {
                    services.stop().await;
                    bail!("Conversation has no single other participant; pass --to");
                }
            }
        }
    };

    let media = if audio_only {
        MediaKind::Audio
    } else {
        MediaKind::Video
    };
    if let Err(e) = services
        .controller
        .start_outgoing_call(CallTarget::new(conversation_id, peer_user_id), media)
        .await
    {
        services.stop().await;
        return Err(e).context("Call failed");
    }

    let mut controls = spawn_controls();
    let mut hangup_at: Option<tokio::time::Instant> = None;
    loop {
        let sleep_until = hangup_at.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if services.controller.phase() == CallPhase::Inviting {
                    println!("Cancelling...");
                } else {
                    println!("Hanging up...");
                }
                break;
            }
            Some(control) = controls.recv() => apply(&services.controller, control).await,
            _ = tokio::time::sleep_until(sleep_until), if hangup_at.is_some() => {
                println!("Duration reached, hanging up...");
                break;
            }
            event = services.events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if let CallEvent::PhaseChanged { phase, .. } = &event {
                    match phase {
                        CallPhase::Active if hangup_at.is_none() => {
                            hangup_at = Some(tokio::time::Instant::now() + Duration::from_secs(duration));
                        }
                        CallPhase::Idle => break,
                        _ => {}
                    }
                }
            }
        }
    }

    services.stop().await;
    Ok(())
}

/// Wait for incoming calls until Ctrl-C.
pub async fn run_listen(auto_accept: bool) -> Result<()> {
    let mut services = Services::start().await?;
    println!("Listening for calls. Press Ctrl-C to quit.");
    let mut controls = spawn_controls();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(control) = controls.recv() => apply(&services.controller, control).await,
            event = services.events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if matches!(event, CallEvent::IncomingCall { .. }) {
                    if auto_accept {
                        apply(&services.controller, Control::Accept).await;
                    } else {
                        println!("Type a to accept or r to reject");
                    }
                }
            }
        }
    }

    services.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controls() {
        assert_eq!(Control::parse("a"), Some(Control::Accept));
        assert_eq!(Control::parse(" Reject \n"), Some(Control::Reject));
        assert_eq!(Control::parse("m"), Some(Control::Mute));
        assert_eq!(Control::parse("camera"), Some(Control::Camera));
        assert_eq!(Control::parse("h"), Some(Control::HangUp));
        assert_eq!(Control::parse("x"), None);
        assert_eq!(Control::parse(""), None);
    }
}
