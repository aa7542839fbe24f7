//! Subprocess-based local audio capture (spec.md §4.E).
//!
//! Grounded on `examples/original_source/audiosource.go` (`AudioSource`,
//! `RunLoop`, `recvLoop`). A capture child (`arecord`) is piped into an
//! encode child (`ffmpeg`) that re-muxes raw PCM into MPEG-TS/AAC; either
//! child's death tears down the other and triggers a backoff restart.
//!
//! The restart bookkeeping differs from the Go version in one respect: Go
//! recreates the `RecvPacket`/`Exits` channels on restart and lets the old
//! `recvLoop` goroutine block forever on its stale channel (effectively
//! leaked, since nothing reads it again except a one-shot drain). Here each
//! generation gets a fresh channel pair and the *previous* generation's
//! receiver is simply dropped — the old `recv_loop` task's next `send`
//! fails immediately and it exits, so there's no leaked task.

use std::time::Duration;

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::proc::{self, CmdExit};
use crate::sink::SinkHandle;
use crate::ts::TS_PACKET_LEN;

const CAPTURE_PROG: &str = "arecord";
const ENCODE_PROG: &str = "ffmpeg";
const RAW_BUF_LEN: usize = 100 * TS_PACKET_LEN;
const BACKOFF: Duration = Duration::from_secs(3);

/// Lifecycle events the coordinator reacts to by creating/tearing down the
/// audio sink (spec.md §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEvent {
    Startup,
    Shutdown,
}

/// Handle to a running audio capture actor.
#[derive(Clone)]
pub struct AudioHandle {
    attach_tx: mpsc::Sender<Option<SinkHandle>>,
}

impl AudioHandle {
    /// Binds (or unbinds, with `None`) the sink that raw audio bytes are
    /// forwarded to.
    pub async fn attach_sink(&self, sink: Option<SinkHandle>) {
        let _ = self.attach_tx.send(sink).await;
    }
}

/// Spawns the audio capture actor and returns a handle plus the event
/// stream the coordinator should drive sink creation/teardown from.
pub fn spawn(device: String, num_channels: u32, rate: u32) -> (AudioHandle, mpsc::Receiver<AudioEvent>) {
    let (attach_tx, mut attach_rx) = mpsc::channel(4);
    let (event_tx, event_rx) = mpsc::channel(4);

    tokio::spawn(async move {
        let mut sink: Option<SinkHandle> = None;
        let mut active: Option<ActiveGeneration> = None;
        let mut backoff_deadline: Option<Instant> = None;

        match start_generation(&device, num_channels, rate) {
            Ok(gen) => {
                active = Some(gen);
                let _ = event_tx.send(AudioEvent::Startup).await;
            }
            Err(e) => {
                warn!("audio capture failed to start: {}", e);
                backoff_deadline = Some(Instant::now() + BACKOFF);
            }
        }

        loop {
            tokio::select! {
                Some(sink_opt) = attach_rx.recv() => {
                    sink = sink_opt;
                }
                Some(exit) = recv_exit(&mut active) => {
                    info!("audio: {} exited: {:?}", exit.label, exit.result);
                    if let Some(gen) = active.take() {
                        gen.kill_sibling_of(exit.label);
                    }
                    let _ = event_tx.send(AudioEvent::Shutdown).await;
                    backoff_deadline = Some(Instant::now() + BACKOFF);
                }
                Some(buf) = recv_audio(&mut active) => {
                    if let Some(sink) = &sink {
                        sink.raw_write(buf).await;
                    }
                }
                _ = sleep_until_opt(backoff_deadline), if backoff_deadline.is_some() => {
                    backoff_deadline = None;
                    info!("restarting audio capture");
                    match start_generation(&device, num_channels, rate) {
                        Ok(gen) => {
                            active = Some(gen);
                            let _ = event_tx.send(AudioEvent::Startup).await;
                        }
                        Err(e) => {
                            warn!("audio capture failed to restart: {}", e);
                            backoff_deadline = Some(Instant::now() + BACKOFF);
                        }
                    }
                }
            }
        }
    });

    (AudioHandle { attach_tx }, event_rx)
}

struct ActiveGeneration {
    capture: proc::Supervised,
    encode: proc::Supervised,
    exit_rx: mpsc::Receiver<CmdExit>,
    recv_rx: mpsc::Receiver<Vec<u8>>,
}

impl ActiveGeneration {
    fn kill_sibling_of(&self, exited_label: &str) {
        let result = if exited_label == "audio-capture" {
            self.encode.kill()
        } else {
            self.capture.kill()
        };
        if let Err(e) = result {
            warn!("audio: failed to kill sibling process: {}", e);
        }
    }
}

async fn recv_exit(active: &mut Option<ActiveGeneration>) -> Option<CmdExit> {
    match active {
        Some(gen) => gen.exit_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_audio(active: &mut Option<ActiveGeneration>) -> Option<Vec<u8>> {
    match active {
        Some(gen) => gen.recv_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn start_generation(device: &str, num_channels: u32, rate: u32) -> crate::error::Result<ActiveGeneration> {
    let mut capture = Command::new(CAPTURE_PROG);
    capture
        .arg("--file-type=raw")
        .arg("--format=S32_LE")
        .arg(format!("--channels={}", num_channels))
        .arg(format!("--rate={}", rate))
        .arg(format!("--device={}", device));

    let mut encode = Command::new(ENCODE_PROG);
    encode
        .arg("-f")
        .arg("s32le")
        .arg("-ar")
        .arg(rate.to_string())
        .arg("-ac")
        .arg(num_channels.to_string())
        .arg("-i")
        .arg("/dev/stdin")
        .arg("-f")
        .arg("mpegts")
        .arg("-strict")
        .arg("-2")
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg("2048k")
        .arg("-");

    proc::pipe(&mut capture, &mut encode)?;

    let (exit_tx, exit_rx) = mpsc::channel(2);

    let capture_handle = proc::run_and_report(capture, "audio-capture", exit_tx.clone())?;
    let (encode_handle, stdout) = proc::run_and_report_piped(encode, "audio-encode", exit_tx)?;

    let (recv_tx, recv_rx) = mpsc::channel(4);
    tokio::spawn(recv_loop(stdout, recv_tx));

    Ok(ActiveGeneration {
        capture: capture_handle,
        encode: encode_handle,
        exit_rx,
        recv_rx,
    })
}

async fn recv_loop(mut output: ChildStdout, tx: mpsc::Sender<Vec<u8>>) {
    let mut raw = vec![0u8; RAW_BUF_LEN];
    let mut start = 0usize;

    loop {
        let n = match output.read(&mut raw[start..]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        let end = start + n;
        let residual = end % TS_PACKET_LEN;
        let aligned_end = end - residual;

        if tx.send(raw[..aligned_end].to_vec()).await.is_err() {
            break;
        }

        if residual != 0 {
            raw.copy_within(aligned_end..end, 0);
        }
        start = residual;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_buf_len_is_a_whole_number_of_ts_packets() {
        assert_eq!(RAW_BUF_LEN % TS_PACKET_LEN, 0);
    }
}
