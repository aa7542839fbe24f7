//! Central event coordinator (spec.md §4.G).
//!
//! Grounded on `examples/original_source/src/recstation/main.go`
//! (`RunMain`'s event loop) and `state.go` (`State`, `StatusMessage`,
//! `MakeState`). Owns the authoritative sink map, reacts to heartbeat
//! ONLINE/OFFLINE and audio STARTUP/SHUTDOWN events, and serves the
//! operator-facing RECORD/STOP/STATUS/PREVIEW requests that the HTTP
//! surface (`crate::http`) forwards to it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::{RecError, Result};
use crate::filename;
use crate::heartbeat::HeartbeatEvent;
use crate::preview;
use crate::sink::{self, SinkHandle};
use crate::source::audio::{AudioEvent, AudioHandle};
use crate::source::udp::{SinkBinding, UdpSource};

/// Resolution and framerate the preview decoder is started at. Not
/// specified anywhere in the original's config — `MakePreview` there takes
/// these as plain call-site constants, so they are fixed here the same way
/// rather than invented into a config surface spec.md doesn't ask for.
const PREVIEW_WIDTH: u32 = 320;
const PREVIEW_HEIGHT: u32 = 240;
const PREVIEW_FRAMERATE: u32 = 5;

const AUDIO_SINK_NAME: &str = "audio";

/// JSON status snapshot served by `GET /api/v1/status` (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    pub hostname: String,
    pub recording: bool,
    pub recording_duration: f64,
    pub sinks: Vec<String>,
}

enum CoordinatorMessage {
    Record(oneshot::Sender<bool>),
    Stop(oneshot::Sender<bool>),
    Status(oneshot::Sender<StatusMessage>),
    Preview {
        sink: String,
        next: bool,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
}

/// Handle to the running coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// `POST /api/v1/record`: starts a recording session. Returns `false`
    /// if a session was already in progress.
    pub async fn record(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CoordinatorMessage::Record(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// `POST /api/v1/stop`: ends the current recording session. Returns
    /// `false` if nothing was recording.
    pub async fn stop(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CoordinatorMessage::Stop(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// `GET /api/v1/status`.
    pub async fn status(&self) -> Option<StatusMessage> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(CoordinatorMessage::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    /// `GET /api/v1/preview`. `Ok(None)` means the named sink exists but has
    /// no preview attached (spec.md §4.G: "if no preview, reply with no
    /// error and a null result").
    pub async fn preview(&self, sink: impl Into<String>, next: bool) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::Preview {
                sink: sink.into(),
                next,
                reply: tx,
            })
            .await
            .map_err(|_| RecError::Process("coordinator has exited".into()))?;
        rx.await
            .map_err(|_| RecError::Process("coordinator dropped the request".into()))?
    }
}

struct SinkEntry {
    handle: SinkHandle,
    preview: Option<preview::PreviewHandle>,
}

/// Resolves a multicast destination to its operator-facing stream name:
/// the configured friendly name if mapped, otherwise the dotted address
/// itself (spec.md §4.G's "or the dotted IP if unmapped").
fn name_for(settings: &Settings, dst: Ipv4Addr) -> String {
    settings
        .groups
        .iter()
        .find(|g| g.addr == dst)
        .map(|g| g.name.clone())
        .unwrap_or_else(|| dst.to_string())
}

/// Spawns the coordinator actor. `udp` is used to (un)register per-group
/// sink bindings; `audio`/`audio_events` are the handle and event stream
/// returned by [`crate::source::audio::spawn`]; `heartbeat_events` is the
/// stream returned by [`crate::heartbeat::spawn`].
pub fn spawn(
    settings: Arc<Settings>,
    udp: UdpSource,
    audio: AudioHandle,
    mut audio_events: mpsc::Receiver<AudioEvent>,
    mut heartbeat_events: mpsc::Receiver<HeartbeatEvent>,
) -> CoordinatorHandle {
    let (tx, mut rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut sinks: HashMap<String, SinkEntry> = HashMap::new();
        let mut recording = false;
        let mut recording_start = Instant::now();
        let mut rotation = tokio::time::interval(settings.new_output_every.max(Duration::from_millis(1)));
        rotation.tick().await; // first tick fires immediately; consume it

        let audio_namer = filename::namer(
            settings.output_filename.clone(),
            settings.output_timestamp.clone(),
            settings.hostname.clone(),
            AUDIO_SINK_NAME.to_string(),
        );
        let audio_sink = sink::spawn(AUDIO_SINK_NAME, audio_namer);
        audio.attach_sink(Some(audio_sink.clone())).await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        CoordinatorMessage::Record(reply) => {
                            if recording {
                                let _ = reply.send(false);
                            } else {
                                recording = true;
                                recording_start = Instant::now();

                                // Re-arm so the next tick is a full period away.
                                // tokio::time::interval defaults to
                                // MissedTickBehavior::Burst, so reusing the
                                // interval created at actor startup would fire
                                // immediately here after any idle stretch.
                                rotation = tokio::time::interval(settings.new_output_every.max(Duration::from_millis(1)));
                                rotation.tick().await;

                                for entry in sinks.values() {
                                    entry.handle.open_file().await;
                                }
                                let _ = reply.send(true);
                            }
                        }
                        CoordinatorMessage::Stop(reply) => {
                            if !recording {
                                let _ = reply.send(false);
                            } else {
                                recording = false;
                                for entry in sinks.values() {
                                    entry.handle.stop().await;
                                }
                                let _ = reply.send(true);
                            }
                        }
                        CoordinatorMessage::Status(reply) => {
                            let duration = if recording {
                                recording_start.elapsed().as_secs_f64()
                            } else {
                                0.0
                            };
                            let mut names: Vec<String> = sinks.keys().cloned().collect();
                            names.sort();
                            let _ = reply.send(StatusMessage {
                                hostname: settings.hostname.clone(),
                                recording,
                                recording_duration: duration,
                                sinks: names,
                            });
                        }
                        CoordinatorMessage::Preview { sink, next, reply } => {
                            match sinks.get(&sink).and_then(|e| e.preview.clone()) {
                                Some(preview) => {
                                    let result = preview.jpeg(next).await.map(Some);
                                    let _ = reply.send(result);
                                }
                                None => {
                                    let _ = reply.send(Ok(None));
                                }
                            }
                        }
                    }
                }

                event = heartbeat_events.recv() => {
                    let Some(event) = event else { continue };
                    let name = name_for(&settings, event.dst);

                    if event.online {
                        info!("coordinator: {} ({} => {}) is ONLINE", name, event.src, event.dst);

                        let namer = filename::namer(
                            settings.output_filename.clone(),
                            settings.output_timestamp.clone(),
                            settings.hostname.clone(),
                            name.clone(),
                        );
                        let handle = sink::spawn(name.clone(), namer);
                        let preview_handle = preview::spawn(PREVIEW_WIDTH, PREVIEW_HEIGHT, PREVIEW_FRAMERATE);

                        udp.add_sink(event.dst, SinkBinding {
                            handle: handle.clone(),
                            preview: Some(preview_handle.input.clone()),
                        }).await;

                        if recording {
                            handle.open_file().await;
                        }

                        sinks.insert(name, SinkEntry {
                            handle,
                            preview: Some(preview_handle),
                        });
                    } else {
                        info!("coordinator: {} ({} => {}) is OFFLINE", name, event.src, event.dst);

                        udp.leave_group(event.dst).await;
                        udp.remove_sink(event.dst).await;

                        if let Some(entry) = sinks.remove(&name) {
                            if let Some(preview) = &entry.preview {
                                preview.shutdown().await;
                            }
                            entry.handle.offline().await;
                        }
                    }
                }

                event = audio_events.recv() => {
                    let Some(event) = event else { continue };
                    match event {
                        AudioEvent::Startup => {
                            info!("coordinator: audio source STARTUP");
                            if recording {
                                audio_sink.open_file().await;
                            }
                            sinks.insert(AUDIO_SINK_NAME.to_string(), SinkEntry {
                                handle: audio_sink.clone(),
                                preview: None,
                            });
                        }
                        AudioEvent::Shutdown => {
                            info!("coordinator: audio source SHUTDOWN");
                            audio_sink.stop().await;
                            sinks.remove(AUDIO_SINK_NAME);
                        }
                    }
                }

                _ = rotation.tick(), if recording => {
                    for entry in sinks.values() {
                        entry.handle.open_file().await;
                    }
                }
            }
        }

        let _ = &sinks; // entries drop their handles; actors tear down via channel closure
    });

    CoordinatorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Group;

    fn settings_with_group(name: &str, addr: Ipv4Addr) -> Settings {
        Settings {
            hostname: "rec1".to_string(),
            iface_name: "eth0".to_string(),
            output_filename: "{{stream}}.ts".to_string(),
            output_timestamp: "%Y%m%d".to_string(),
            groups: vec![Group { name: name.to_string(), addr }],
            new_output_every: Duration::from_secs(60),
            source_listen: "0.0.0.0:5004".parse().unwrap(),
            heartbeat_listen: "0.0.0.0:5005".parse().unwrap(),
            heartbeat_timeout: Duration::from_secs(3),
            http_listen: "0.0.0.0:8080".parse().unwrap(),
            alsa_device: "hw:0,0".to_string(),
            alsa_num_channels: 2,
            alsa_bitrate: 48000,
        }
    }

    #[test]
    fn name_for_resolves_configured_friendly_names() {
        let settings = settings_with_group("cam1", Ipv4Addr::new(239, 255, 42, 42));
        assert_eq!(name_for(&settings, Ipv4Addr::new(239, 255, 42, 42)), "cam1");
    }

    #[test]
    fn name_for_falls_back_to_dotted_ip_when_unmapped() {
        let settings = settings_with_group("cam1", Ipv4Addr::new(239, 255, 42, 42));
        assert_eq!(name_for(&settings, Ipv4Addr::new(239, 1, 1, 9)), "239.1.1.9");
    }
}
