//! High-rate frame receiver.
//!
//! Each datagram carries a 32-bit big-endian packet sequence number in its
//! first 4 bytes followed by 16-bit payload words. A frame starts at the
//! datagram whose words 2..3 are the SOF marker and ends at the datagram
//! whose last two words are the EOF marker. Payloads (header stripped) are
//! concatenated into the caller's [`FrameBuffer`]. Sequence numbers must be
//! contiguous from SOF to EOF; a gap discards the whole frame. Lost datagrams
//! are never requested again.
use crate::config::{DataConfig, DATA_HEADER_BYTES, EOF_MARKER, MAX_DATAGRAM_WORDS, SOF_MARKER};
use crate::error::{GermError, Result};
use crate::frame::{word_at, FrameBuffer};
use crate::iface;
use crate::shutdown::StopSignal;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Anything that can fill a [`FrameBuffer`] with one complete frame.
pub trait FrameSource {
    /// Returns the number of 16-bit words written.
    fn receive_frame(&mut self, buf: &mut FrameBuffer) -> Result<usize>;

    /// Throughput of the last good frame in MB/s.
    fn bitrate(&self) -> f64 {
        0.0
    }
}

/// Outcome of a successfully reassembled frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub words: usize,
    pub packets: u32,
    pub bytes_received: usize,
    pub elapsed: Duration,
    /// Bytes per microsecond, i.e. MB/s.
    pub bitrate: f64,
}

/// Datagram-at-a-time reassembly state for one frame.
#[derive(Debug, Default)]
pub struct Reassembler {
    started: Option<Instant>,
    first_seq: u32,
    expected: u32,
    frame_number: u32,
    bytes_received: usize,
    overflowed: bool,
    /// Packets lost, duplicated or reordered since SOF.
    missing: u32,
}

/// What the reassembler wants after a datagram.
#[derive(Debug, PartialEq)]
pub enum Progress {
    More,
    Complete(FrameStats),
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram. Returns `Complete` after the EOF datagram, or the
    /// reason the frame is unusable. The reassembler is reset either way.
    pub fn push(&mut self, datagram: &[u8], out: &mut FrameBuffer) -> Result<Progress> {
        if datagram.len() < 2 * DATA_HEADER_BYTES {
            warn!(len = datagram.len(), "dropping runt data datagram");
            return Ok(Progress::More);
        }
        let seq = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let n_words = datagram.len() / 2;
        let is_sof = word_at(datagram, 2) == Some(SOF_MARKER[0]) && word_at(datagram, 3) == Some(SOF_MARKER[1]);
        let is_eof = word_at(datagram, n_words - 2) == Some(EOF_MARKER[0])
            && word_at(datagram, n_words - 1) == Some(EOF_MARKER[1]);
        trace!(seq, len = datagram.len(), is_sof, is_eof, "data datagram");

        if is_sof {
            if self.started.is_some() {
                warn!(seq, frame = self.frame_number, "SOF inside open frame; restarting");
            }
            self.started = Some(Instant::now());
            self.first_seq = seq;
            self.expected = seq;
            self.frame_number = sof_frame_number(datagram);
            self.bytes_received = 0;
            self.overflowed = false;
            self.missing = 0;
            out.clear();
            debug!(seq, frame = self.frame_number, "start of frame");
        }

        let Some(started) = self.started else {
            if is_eof {
                error!(seq, "EOF before SOF");
                return Err(GermError::ProtocolViolation("end of frame before start of frame".into()));
            }
            debug!(seq, "dropping datagram outside a frame");
            return Ok(Progress::More);
        };

        // Forward jumps count the skipped packets and resync; a duplicate or
        // late packet counts once and leaves the expected number alone.
        let skipped = seq.wrapping_sub(self.expected);
        let forward = skipped < u32::MAX / 2;
        if skipped != 0 {
            warn!(seq, expected = self.expected, frame = self.frame_number, "packet out of sequence");
            self.missing = self.missing.saturating_add(if forward { skipped } else { 1 });
        }
        if forward {
            self.expected = seq.wrapping_add(1);
        }

        self.bytes_received += datagram.len();
        if !self.overflowed && !out.append(&datagram[DATA_HEADER_BYTES..]) {
            error!(capacity = out.capacity(), frame = self.frame_number, "frame exceeds reassembly buffer");
            self.overflowed = true;
        }

        if !is_eof {
            return Ok(Progress::More);
        }

        let elapsed = started.elapsed();
        let state = std::mem::take(self);
        if state.missing > 0 {
            error!(frame = state.frame_number, missing = state.missing, "dropped packets; discarding frame");
            out.clear();
            return Err(GermError::FrameIntegrity { frame: state.frame_number, missing: state.missing });
        }
        if state.overflowed {
            out.clear();
            return Err(GermError::FrameTooLarge { capacity: out.capacity() });
        }

        let micros = (elapsed.as_secs_f64() * 1e6).max(1.0);
        let stats = FrameStats {
            words: out.word_count(),
            packets: seq.wrapping_sub(state.first_seq).wrapping_add(1),
            bytes_received: state.bytes_received,
            elapsed,
            bitrate: state.bytes_received as f64 / micros,
        };
        Ok(Progress::Complete(stats))
    }
}

/// Frame number carried right after the SOF marker, 0 if the datagram is too short.
fn sof_frame_number(datagram: &[u8]) -> u32 {
    match (word_at(datagram, 4), word_at(datagram, 5)) {
        (Some(hi), Some(lo)) => ((hi as u32) << 16) | lo as u32,
        _ => 0,
    }
}

pub struct DataChannel {
    socket: UdpSocket,
    stop: Option<StopSignal>,
    poll_interval: Duration,
    bitrate: f64,
    pixel_count: usize,
    recv_buf: Box<[u8]>,
}

impl DataChannel {
    /// Bind the data receive port with an enlarged OS receive buffer.
    pub fn open(config: &DataConfig) -> Result<Self> {
        let local = SocketAddrV4::new(iface::bind_address(config.interface.as_deref()), config.rx_port);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            error!(error = %e, "data socket creation failed");
            GermError::Io(e)
        })?;
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_bytes) {
            warn!(requested = config.recv_buffer_bytes, error = %e, "could not set data receive buffer size");
        }
        let granted = socket.recv_buffer_size().unwrap_or(0);
        if granted < config.recv_buffer_bytes {
            // Linux caps the request at net.core.rmem_max (and reports double the request).
            warn!(requested = config.recv_buffer_bytes, granted, "data receive buffer smaller than requested");
        }
        socket.bind(&SockAddr::from(local)).map_err(|e| {
            error!(%local, error = %e, "data socket bind failed");
            GermError::Io(e)
        })?;
        let socket: UdpSocket = socket.into();
        info!(local = %socket.local_addr()?, client = %config.client_ip(), recv_buffer = granted, "data channel open");
        Ok(Self {
            socket,
            stop: None,
            poll_interval: config.poll_interval,
            bitrate: 0.0,
            pixel_count: 0,
            recv_buf: vec![0u8; MAX_DATAGRAM_WORDS * 2].into_boxed_slice(),
        })
    }

    /// Make blocking receives return [`GermError::Interrupted`] once `stop` fires.
    pub fn with_stop(mut self, stop: StopSignal) -> Result<Self> {
        self.socket.set_read_timeout(Some(self.poll_interval))?;
        self.stop = Some(stop);
        Ok(self)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagrams until one full frame has been reassembled into `buf`.
    ///
    /// Returns the frame's word count. Blocks until an EOF datagram arrives;
    /// `buf` must be sized for the largest expected frame.
    pub fn receive_frame(&mut self, buf: &mut FrameBuffer) -> Result<usize> {
        let mut reassembler = Reassembler::new();
        loop {
            let n = self.recv_datagram()?;
            match reassembler.push(&self.recv_buf[..n], buf)? {
                Progress::More => continue,
                Progress::Complete(stats) => {
                    self.bitrate = stats.bitrate;
                    self.pixel_count = stats.words;
                    info!(
                        packets = stats.packets,
                        mb = stats.words as f64 * 2.0 / 1e6,
                        mb_per_s = stats.bitrate,
                        "frame received"
                    );
                    return Ok(stats.words);
                }
            }
        }
    }

    /// MB/s of the last good frame.
    pub fn bitrate(&self) -> f64 {
        self.bitrate
    }

    /// Words in the last good frame.
    pub fn pixel_count(&self) -> usize {
        self.pixel_count
    }

    pub fn close(self) {
        debug!("data channel closed");
    }

    fn recv_datagram(&mut self) -> Result<usize> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((n, _)) => return Ok(n),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.stop.as_ref().is_some_and(StopSignal::is_triggered) {
                        info!("frame receive interrupted");
                        return Err(GermError::Interrupted);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "data receive failed");
                    return Err(GermError::Io(e));
                }
            }
        }
    }
}

impl FrameSource for DataChannel {
    fn receive_frame(&mut self, buf: &mut FrameBuffer) -> Result<usize> {
        DataChannel::receive_frame(self, buf)
    }

    fn bitrate(&self) -> f64 {
        self.bitrate
    }
}
