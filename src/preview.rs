//! Per-sink JPEG preview (spec.md §4.H).
//!
//! Grounded on `examples/original_source/src/recstation/preview.go`
//! (`Preview`, `RunLoop`, `recvLoop`). A decoder subprocess turns the raw
//! MPEG-TS fed into it back into raw BGRA frames at a fixed resolution and
//! framerate; the actor retains only the most recent frame and serves JPEG
//! snapshots of it on request, either immediately or on the next frame's
//! arrival.
//!
//! The original's `JpegRequest` writes straight into an `io.Writer` handed
//! in by the caller. An `axum` handler's response body isn't a
//! `std::io::Write`, so requests here return an owned JPEG byte buffer
//! instead, which the HTTP layer wraps as a response body.
//!
//! The decoder child is spawned through `proc::supervisor`, the same
//! plumbing `source::audio` uses, so its owner (the coordinator, on a
//! sink going offline) can kill it via `PreviewHandle::shutdown` instead of
//! leaving it to exit (or leak) on its own.

use std::io::IoSlice;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};
use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{RecError, Result};
use crate::proc::{self, Supervised};

const DECODE_PROG: &str = "ffmpeg";
const PIX_FMT: &str = "bgra";
const BYTES_PER_PIXEL: usize = 4;

/// Current lifecycle state of a preview's decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewState {
    Starting,
    Running,
    /// Terminal: a decoder that exits never restarts (spec.md §4.H).
    Exited,
}

/// The shared pipe a preview's decoder reads MPEG-TS from. Written by the
/// UDP source's `RunLoop` (spec.md §5's one sanctioned cross-actor shared
/// resource); detaching on write failure is idempotent.
pub struct PreviewInput {
    inner: Mutex<Option<ChildStdin>>,
}

impl PreviewInput {
    fn empty() -> Arc<Self> {
        Arc::new(PreviewInput {
            inner: Mutex::new(None),
        })
    }

    async fn attach(&self, stdin: ChildStdin) {
        *self.inner.lock().await = Some(stdin);
    }

    async fn detach(&self) {
        *self.inner.lock().await = None;
    }

    /// Vectored-writes a packet batch into the decoder's stdin. Returns
    /// `false` (and detaches) on any write error or if no decoder is
    /// currently attached.
    pub async fn write_vectored(&self, slices: &[IoSlice<'_>]) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };

        let nbytes: usize = slices.iter().map(|s| s.len()).sum();

        match stdin.write_vectored(slices).await {
            Ok(n) if n == nbytes => true,
            Ok(n) => {
                warn!("preview input short write: {} of {} bytes", n, nbytes);
                true
            }
            Err(e) => {
                warn!("preview input write failed: {}", e);
                *guard = None;
                false
            }
        }
    }
}

enum PreviewMessage {
    RecvBuf {
        frame: Option<Vec<u8>>,
    },
    JpegRequest {
        next: bool,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Exit {
        result: std::io::Result<std::process::ExitStatus>,
    },
    /// Sent by the owner (the coordinator, tearing down an offline sink) to
    /// kill the decoder subprocess (spec.md §4.B: killing is the owner's
    /// responsibility).
    Kill,
}

/// Handle to a running preview actor.
#[derive(Clone)]
pub struct PreviewHandle {
    tx: mpsc::Sender<PreviewMessage>,
    /// Shared with the UDP source so it can feed this preview's decoder
    /// directly, without routing frames through the actor's own mailbox.
    pub input: Arc<PreviewInput>,
}

impl PreviewHandle {
    /// Requests a JPEG snapshot of the most recently decoded frame.
    /// `next = true` waits for the next frame to arrive before encoding.
    pub async fn jpeg(&self, next: bool) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PreviewMessage::JpegRequest { next, reply: tx })
            .await
            .map_err(|_| RecError::Process("preview actor has exited".into()))?;
        rx.await
            .map_err(|_| RecError::Process("preview actor dropped the request".into()))?
    }

    /// Kills the decoder subprocess and marks the preview permanently
    /// exited. Called by the coordinator before dropping a sink's preview
    /// entry, so the decoder doesn't outlive the sink it was feeding.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(PreviewMessage::Kill).await;
    }
}

struct PreviewActor {
    width: u32,
    height: u32,
    framerate: u32,
    frame_len: usize,
    image: RgbaImage,
    state: PreviewState,
    pending_next: Vec<oneshot::Sender<Result<Vec<u8>>>>,
    decoder: Option<Supervised>,
}

/// Spawns a preview actor for a `width`x`height` stream at `framerate` fps
/// and immediately starts its decoder.
pub fn spawn(width: u32, height: u32, framerate: u32) -> PreviewHandle {
    let (tx, mut rx) = mpsc::channel(32);
    let input = PreviewInput::empty();
    let handle = PreviewHandle {
        tx: tx.clone(),
        input: input.clone(),
    };

    tokio::spawn(async move {
        let mut state = PreviewActor {
            width,
            height,
            framerate,
            frame_len: (width * height) as usize * BYTES_PER_PIXEL,
            image: RgbaImage::new(width, height),
            state: PreviewState::Starting,
            pending_next: Vec::new(),
            decoder: None,
        };

        match start_decoder(&state, input.clone(), tx.clone()).await {
            Ok(supervised) => {
                state.decoder = Some(supervised);
                state.state = PreviewState::Running;
            }
            Err(e) => {
                warn!("failed to start preview decoder: {}", e);
                state.state = PreviewState::Exited;
            }
        }

        while let Some(msg) = rx.recv().await {
            match msg {
                PreviewMessage::RecvBuf { frame } => match frame {
                    Some(bytes) => {
                        copy_bgra_into(&mut state.image, &bytes);
                        for waiter in state.pending_next.drain(..) {
                            let _ = waiter.send(encode_jpeg(&state.image));
                        }
                    }
                    None => {
                        // a read error on the decoder's stdout; treated the
                        // same as a process exit by the caller task.
                    }
                },
                PreviewMessage::JpegRequest { next, reply } => {
                    if next && state.state != PreviewState::Exited {
                        state.pending_next.push(reply);
                    } else {
                        let _ = reply.send(encode_jpeg(&state.image));
                    }
                }
                PreviewMessage::Exit { result } => {
                    info!("preview decoder exited: {:?}", result);
                    state.decoder = None;
                    input.detach().await;
                    state.state = PreviewState::Exited;
                    for waiter in state.pending_next.drain(..) {
                        let _ = waiter.send(encode_jpeg(&state.image));
                    }
                }
                PreviewMessage::Kill => {
                    if let Some(decoder) = state.decoder.take() {
                        if let Err(e) = decoder.kill() {
                            warn!("failed to kill preview decoder: {}", e);
                        }
                    }
                    input.detach().await;
                    state.state = PreviewState::Exited;
                    for waiter in state.pending_next.drain(..) {
                        let _ = waiter.send(encode_jpeg(&state.image));
                    }
                }
            }
        }
    });

    handle
}

async fn start_decoder(
    state: &PreviewActor,
    input: Arc<PreviewInput>,
    tx: mpsc::Sender<PreviewMessage>,
) -> Result<Supervised> {
    let mut decoder = Command::new(DECODE_PROG);
    decoder
        .arg("-i")
        .arg("pipe:")
        .arg("-r")
        .arg(state.framerate.to_string())
        .arg("-s")
        .arg(format!("{}x{}", state.width, state.height))
        .arg("-pix_fmt")
        .arg(PIX_FMT)
        .arg("-f")
        .arg("rawvideo")
        .arg("pipe:")
        .stderr(std::process::Stdio::null());

    let (exit_tx, mut exit_rx) = mpsc::channel(1);
    let (supervised, stdin, stdout) =
        proc::run_and_report_duplex(decoder, "preview-decoder", exit_tx)?;

    input.attach(stdin).await;

    let frame_len = state.frame_len;
    let recv_tx = tx.clone();
    tokio::spawn(recv_loop(stdout, frame_len, recv_tx));

    tokio::spawn(async move {
        if let Some(exit) = exit_rx.recv().await {
            let _ = tx.send(PreviewMessage::Exit { result: exit.result }).await;
        }
    });

    Ok(supervised)
}

async fn recv_loop(mut stdout: ChildStdout, frame_len: usize, tx: mpsc::Sender<PreviewMessage>) {
    let mut buf = vec![0u8; frame_len];

    loop {
        let mut start = 0;
        let mut failed = false;

        while start < frame_len {
            match stdout.read(&mut buf[start..]).await {
                Ok(0) => {
                    failed = true;
                    break;
                }
                Ok(n) => start += n,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }

        let frame = if failed { None } else { Some(buf.clone()) };
        let is_eof = frame.is_none();

        if tx.send(PreviewMessage::RecvBuf { frame }).await.is_err() || is_eof {
            break;
        }
    }
}

fn copy_bgra_into(image: &mut RgbaImage, bgra: &[u8]) {
    let pixels = image.as_flat_samples_mut().samples;
    let n = pixels.len().min(bgra.len());
    for i in (0..n).step_by(4) {
        if i + 3 >= n {
            break;
        }
        // decoder emits BGRA; image::RgbaImage stores RGBA.
        pixels[i] = bgra[i + 2];
        pixels[i + 1] = bgra[i + 1];
        pixels[i + 2] = bgra[i];
        pixels[i + 3] = bgra[i + 3];
    }
}

fn encode_jpeg(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = JpegEncoder::new(&mut out);
    encoder
        .write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgba8)
        .map_err(|e| RecError::InvalidData(format!("jpeg encode: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_bgra_into_swaps_red_and_blue_channels() {
        let mut image = RgbaImage::new(1, 1);
        let bgra = [10u8, 20, 30, 40]; // B, G, R, A
        copy_bgra_into(&mut image, &bgra);
        let pixel = image.get_pixel(0, 0);
        assert_eq!(pixel.0, [30, 20, 10, 40]);
    }

    #[test]
    fn encode_jpeg_produces_a_non_empty_buffer() {
        let image = RgbaImage::new(4, 4);
        let jpeg = encode_jpeg(&image).unwrap();
        assert!(!jpeg.is_empty());
        // JPEG files start with the SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
