//! Capture orchestration: one request/reply handshake per frame.
//!
//! ```text
//! client                         server
//!   filename  ───────────────▶   "Received Filename"
//!                                 (frame arrives on the data channel)
//!   EOF ack   ───────────────▶   metadata {frame, events, overflows}
//!                                 (frame written to <base>_<frame:03>.bin)
//!   write ack ───────────────▶   written filename
//! ```
//!
//! A damaged frame still runs the full handshake so the client never waits
//! on a reply that will not come, but it is never written out as data.
use crate::config::{CaptureConfig, DamagedFramePolicy, UDP_ENABLE_REGISTER};
use crate::control::ControlTransport;
use crate::data::FrameSource;
use crate::error::{GermError, Result};
use crate::frame::{frame_file_name, persist, FrameBuffer, FrameMetadata, PersistReport};
use crate::register::RegisterAccess;
use crate::shutdown::StopSignal;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const FILENAME_ACK: &[u8] = b"Received Filename";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    AwaitingFilename,
    ReceivingFrame,
    AwaitingEofAck,
    Persisting,
    AwaitingWriteAck,
}

/// Summary of one completed handshake.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub base_name: String,
    pub metadata: FrameMetadata,
    pub words: usize,
    /// Receive throughput of the frame in MB/s, 0 for a damaged frame.
    pub bitrate: f64,
    /// Why the frame was discarded, if it was.
    pub damaged: Option<String>,
    pub written: Option<PersistReport>,
}

pub struct CaptureOrchestrator<T, F> {
    transport: T,
    source: F,
    buffer: FrameBuffer,
    config: CaptureConfig,
    state: CaptureState,
}

impl<T: ControlTransport, F: FrameSource> CaptureOrchestrator<T, F> {
    pub fn new(transport: T, source: F, buffer: FrameBuffer, config: CaptureConfig) -> Self {
        Self { transport, source, buffer, config, state: CaptureState::Idle }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Turn on the client's UDP interface. Failure is logged and reported,
    /// never fatal.
    pub fn enable_udp<R: RegisterAccess>(&self, regs: &mut R) -> bool {
        if !self.config.enable_udp {
            debug!("UDP enable skipped by configuration");
            return false;
        }
        info!("enabling UDP interface on module");
        match regs.write(UDP_ENABLE_REGISTER, 0x1) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "could not enable UDP interface; continuing");
                false
            }
        }
    }

    /// Serve capture cycles until `stop` fires or the transport fails.
    pub fn run(&mut self, stop: &StopSignal) -> Result<()> {
        while !stop.is_triggered() {
            match self.run_cycle() {
                Ok(outcome) => log_outcome(&outcome),
                Err(GermError::Interrupted) => break,
                Err(GermError::ClientDisconnected) => continue,
                Err(e) => {
                    error!(state = ?self.state, error = %e, "capture loop failed");
                    return Err(e);
                }
            }
        }
        info!("capture loop stopped");
        Ok(())
    }

    /// Run one full handshake, from filename request to filename reply.
    ///
    /// If the client goes away mid-handshake the cycle is abandoned, the
    /// state returns to `Idle` and [`GermError::ClientDisconnected`] is
    /// returned; the next cycle starts with a fresh filename request.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.transition(CaptureState::Idle);
        let outcome = self.handshake();
        if let Err(GermError::ClientDisconnected) = &outcome {
            warn!(state = ?self.state, "client lost mid-cycle; cycle aborted");
            self.transition(CaptureState::Idle);
        }
        outcome
    }

    fn handshake(&mut self) -> Result<CycleOutcome> {
        info!("waiting for filename");
        let request = loop {
            match self.transport.recv() {
                Err(GermError::ClientDisconnected) => continue,
                other => break other?,
            }
        };
        let base_name = decode_text(&request);
        if base_name.is_empty() {
            warn!("client sent an empty base filename");
        }
        info!(base = %base_name, "received base filename");
        self.transport.send(FILENAME_ACK)?;
        self.transition(CaptureState::AwaitingFilename);

        info!("ready for event data");
        let frame = match self.source.receive_frame(&mut self.buffer) {
            Ok(words) => Ok(words),
            Err(e) if e.is_damaged_frame() => Err(e),
            Err(e) => return Err(e),
        };
        self.transition(CaptureState::ReceivingFrame);

        let eof_ack = self.transport.recv()?;
        debug!(msg = %decode_text(&eof_ack), "EOF ack");
        let metadata = match &frame {
            Ok(_) => FrameMetadata::from_frame(self.buffer.as_bytes()),
            Err(GermError::FrameIntegrity { frame, .. }) => FrameMetadata::damaged(*frame),
            Err(_) => FrameMetadata::default(),
        };
        info!(
            frame = metadata.frame_number,
            events = metadata.event_count,
            overflows = metadata.overflow_count,
            "frame metadata"
        );
        self.transport.send(&metadata.to_bytes()?)?;
        self.transition(CaptureState::AwaitingEofAck);

        let path = self.output_path(&base_name, metadata.frame_number);
        let written = match &frame {
            Ok(_) => self.write_frame(&path),
            Err(_) if self.config.damaged_frames == DamagedFramePolicy::EmptyFile => self.write_placeholder(&path),
            Err(_) => None,
        };
        self.transition(CaptureState::Persisting);

        let write_ack = self.transport.recv()?;
        debug!(msg = %decode_text(&write_ack), "write ack");
        let reply = written.as_ref().map(|w| w.path.display().to_string()).unwrap_or_default();
        self.transport.send(reply.as_bytes())?;
        self.transition(CaptureState::AwaitingWriteAck);
        self.transition(CaptureState::Idle);

        Ok(CycleOutcome {
            base_name,
            metadata,
            words: *frame.as_ref().unwrap_or(&0),
            bitrate: if frame.is_ok() { self.source.bitrate() } else { 0.0 },
            damaged: frame.err().map(|e| e.to_string()),
            written,
        })
    }

    fn output_path(&self, base: &str, frame_number: u64) -> PathBuf {
        self.config.output_dir.join(frame_file_name(base, frame_number))
    }

    fn write_frame(&self, path: &Path) -> Option<PersistReport> {
        info!(path = %path.display(), "saving frame");
        match persist(self.buffer.as_bytes(), path) {
            Ok(report) => {
                info!(
                    path = %report.path.display(),
                    mb = report.bytes as f64 / 1e6,
                    secs = report.elapsed.as_secs_f64(),
                    crc32 = format_args!("{:08x}", report.crc32),
                    "frame written"
                );
                Some(report)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "frame write failed");
                None
            }
        }
    }

    fn write_placeholder(&self, path: &Path) -> Option<PersistReport> {
        match persist(&[], path) {
            Ok(report) => {
                warn!(path = %path.display(), "wrote empty placeholder for damaged frame");
                Some(report)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "placeholder write failed");
                None
            }
        }
    }

    fn transition(&mut self, next: CaptureState) {
        debug!(from = ?self.state, to = ?next, "capture state");
        self.state = next;
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match (&outcome.damaged, &outcome.written) {
        (Some(reason), _) => warn!(base = %outcome.base_name, reason = %reason, "cycle finished without a frame"),
        (None, Some(w)) => info!(
            file = %w.path.display(),
            words = outcome.words,
            mb_per_s = outcome.bitrate,
            "cycle finished"
        ),
        (None, None) => warn!(base = %outcome.base_name, "cycle finished but the frame was not saved"),
    }
}

/// Control payloads are C strings on some clients; stop at the first NUL.
pub fn decode_text(msg: &[u8]) -> String {
    let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
    String::from_utf8_lossy(&msg[..end]).trim().to_string()
}
