//! In-process stand-in for the FPGA-side client.
//!
//! [`SimulatedModule`] answers the UDP register protocol from an in-memory
//! register map and, when register 0x0 is written with 0x1, streams a
//! synthetic frame to the configured data endpoint. [`FrameBuilder`] produces
//! the datagrams of one frame and can leave gaps in the packet sequence.
use crate::config::{
    DATA_HEADER_BYTES, EOF_MARKER, MAX_DATAGRAM_WORDS, REG_ACCESS_FAIL, REG_ACCESS_OKAY, SOF_MARKER,
};
use crate::shutdown::StopSignal;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Writing 0x1 here triggers one frame.
pub const TRIGGER_REGISTER: u32 = 0x0;

/// Synthetic frame of `events` events split across datagrams.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    frame_number: u32,
    events: usize,
    overflow: u32,
    words_per_packet: usize,
    first_sequence: u32,
    dropped: HashSet<usize>,
}

impl FrameBuilder {
    pub fn new(frame_number: u32) -> Self {
        Self {
            frame_number,
            events: 0,
            overflow: 0,
            words_per_packet: 1024,
            first_sequence: 0,
            dropped: HashSet::new(),
        }
    }

    pub fn events(mut self, n: usize) -> Self {
        self.events = n;
        self
    }

    pub fn overflow(mut self, n: u32) -> Self {
        self.overflow = n;
        self
    }

    /// Payload words per datagram; kept even so the EOF marker never
    /// straddles two datagrams.
    pub fn words_per_packet(mut self, n: usize) -> Self {
        self.words_per_packet = n.clamp(2, MAX_DATAGRAM_WORDS - DATA_HEADER_BYTES / 2) & !1;
        self
    }

    pub fn first_sequence(mut self, seq: u32) -> Self {
        self.first_sequence = seq;
        self
    }

    /// Omit datagram `index` while still consuming its sequence number.
    pub fn drop_packet(mut self, index: usize) -> Self {
        self.dropped.insert(index);
        self
    }

    /// The reassembled frame, as the receiver should see it.
    pub fn frame_words(&self) -> Vec<u16> {
        let mut words = Vec::with_capacity(8 + 4 * self.events);
        words.extend_from_slice(&SOF_MARKER);
        words.extend_from_slice(&split(self.frame_number));
        for i in 0..self.events {
            // Every event word stays below 0x8000 so it can never look like a marker.
            words.push(0x0100 | (i & 0xFF) as u16);
            words.push(((i >> 8) & 0x7FFF) as u16);
            words.push(0x2000 + (i % 0x1000) as u16);
            words.push(0x3000 + (i % 0x1000) as u16);
        }
        words.extend_from_slice(&split(self.overflow));
        words.extend_from_slice(&EOF_MARKER);
        words
    }

    /// Number of sequence numbers the frame consumes, dropped ones included.
    pub fn packet_count(&self) -> usize {
        self.frame_words().len().div_ceil(self.words_per_packet)
    }

    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        self.frame_words()
            .chunks(self.words_per_packet)
            .enumerate()
            .filter(|(i, _)| !self.dropped.contains(i))
            .map(|(i, chunk)| {
                let seq = self.first_sequence.wrapping_add(i as u32);
                let mut d = Vec::with_capacity(DATA_HEADER_BYTES + chunk.len() * 2);
                d.extend_from_slice(&seq.to_be_bytes());
                d.extend(chunk.iter().flat_map(|w| w.to_be_bytes()));
                d
            })
            .collect()
    }
}

fn split(v: u32) -> [u16; 2] {
    [(v >> 16) as u16, v as u16]
}

/// Send each datagram to `dest`, optionally pausing between them.
pub fn send_datagrams(socket: &UdpSocket, dest: SocketAddr, datagrams: &[Vec<u8>], gap: Duration) -> io::Result<()> {
    for d in datagrams {
        socket.send_to(d, dest)?;
        if !gap.is_zero() {
            std::thread::sleep(gap);
        }
    }
    Ok(())
}

/// Shape of the frames emitted on trigger.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub first_frame: u32,
    pub events: usize,
    pub overflow: u32,
    pub words_per_packet: usize,
    pub packet_gap: Duration,
}

impl Default for FramePlan {
    fn default() -> Self {
        Self { first_frame: 1, events: 64, overflow: 0, words_per_packet: 1024, packet_gap: Duration::ZERO }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub ip: Ipv4Addr,
    pub read_port: u16,
    pub write_port: u16,
    /// Where triggered frames go; `None` disables the data stream.
    pub data_dest: Option<SocketAddr>,
    pub frames: FramePlan,
}

impl SimConfig {
    /// Loopback with OS-assigned ports.
    pub fn ephemeral() -> Self {
        Self { ip: Ipv4Addr::LOCALHOST, read_port: 0, write_port: 0, data_dest: None, frames: FramePlan::default() }
    }
}

#[derive(Default)]
struct Shared {
    registers: Mutex<HashMap<u32, u32>>,
    failing: Mutex<HashSet<u32>>,
    reply_delay: Mutex<Duration>,
    next_frame: AtomicU32,
    sequence: AtomicU32,
}

pub struct SimulatedModule {
    read_addr: SocketAddr,
    write_addr: SocketAddr,
    shared: Arc<Shared>,
    stream: Option<Arc<DataStream>>,
    stop: StopSignal,
    threads: Vec<JoinHandle<()>>,
}

impl SimulatedModule {
    pub fn spawn(config: SimConfig) -> io::Result<Self> {
        let read_sock = UdpSocket::bind((config.ip, config.read_port))?;
        let write_sock = UdpSocket::bind((config.ip, config.write_port))?;
        let data_sock = UdpSocket::bind((config.ip, 0))?;
        for s in [&read_sock, &write_sock] {
            s.set_read_timeout(Some(Duration::from_millis(50)))?;
        }
        let shared = Arc::new(Shared::default());
        shared.next_frame.store(config.frames.first_frame, Ordering::Relaxed);
        let stop = StopSignal::new();
        let read_addr = read_sock.local_addr()?;
        let write_addr = write_sock.local_addr()?;
        let stream = config
            .data_dest
            .map(|dest| Arc::new(DataStream { socket: data_sock, dest, plan: config.frames.clone() }));

        let reader = {
            let (shared, stop) = (shared.clone(), stop.clone());
            std::thread::spawn(move || serve(read_sock, &shared, &stop, answer_read, None))
        };
        let writer = {
            let (shared, stop) = (shared.clone(), stop.clone());
            let stream = stream.clone();
            std::thread::spawn(move || serve(write_sock, &shared, &stop, answer_write, stream.as_deref()))
        };
        info!(%read_addr, %write_addr, "simulated module listening");
        Ok(Self { read_addr, write_addr, shared, stream, stop, threads: vec![reader, writer] })
    }

    pub fn read_addr(&self) -> SocketAddr {
        self.read_addr
    }

    pub fn write_addr(&self) -> SocketAddr {
        self.write_addr
    }

    pub fn register(&self, addr: u32) -> Option<u32> {
        lock(&self.shared.registers).get(&addr).copied()
    }

    /// Make every access to `addr` answer with the FAIL sentinel.
    pub fn fail_register(&self, addr: u32) {
        lock(&self.shared.failing).insert(addr);
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        *lock(&self.shared.reply_delay) = delay;
    }

    /// Emit one frame now, as if the trigger register had been written.
    /// Returns false when no data destination is configured.
    pub fn trigger(&self) -> bool {
        match &self.stream {
            Some(stream) => {
                emit_frame(&self.shared, stream);
                true
            }
            None => false,
        }
    }

    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        self.stop.trigger();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for SimulatedModule {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct DataStream {
    socket: UdpSocket,
    dest: SocketAddr,
    plan: FramePlan,
}

/// Answer register commands until stopped. `answer` returns the reply and
/// whether the command triggers a frame.
fn serve(
    socket: UdpSocket,
    shared: &Shared,
    stop: &StopSignal,
    answer: fn(&Shared, &[u32]) -> ([u32; 2], bool),
    stream: Option<&DataStream>,
) {
    let mut buf = [0u8; 64];
    while !stop.is_triggered() {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!(error = %e, "simulated module receive failed");
                return;
            }
        };
        let words: Vec<u32> = buf[..n - n % 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words.len() < 2 {
            debug!(%from, len = n, "ignoring runt register command");
            continue;
        }
        let (reply, triggered) = answer(shared, &words);
        let delay = *lock(&shared.reply_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let bytes: Vec<u8> = reply.iter().flat_map(|w| w.to_be_bytes()).collect();
        if let Err(e) = socket.send_to(&bytes, from) {
            warn!(error = %e, "simulated module reply failed");
        }
        if let (true, Some(stream)) = (triggered, stream) {
            emit_frame(shared, stream);
        }
    }
}

fn fail_reply(addr: u32) -> [u32; 2] {
    [0xFF00_0000 | (addr & 0x00FF_FFFF), REG_ACCESS_FAIL]
}

fn answer_read(shared: &Shared, words: &[u32]) -> ([u32; 2], bool) {
    let addr = words[1];
    if lock(&shared.failing).contains(&addr) {
        return (fail_reply(addr), false);
    }
    let value = lock(&shared.registers).get(&addr).copied().unwrap_or(0);
    ([addr, value], false)
}

fn answer_write(shared: &Shared, words: &[u32]) -> ([u32; 2], bool) {
    let addr = words[1];
    let Some(&value) = words.get(2) else {
        return (fail_reply(addr), false);
    };
    if lock(&shared.failing).contains(&addr) {
        return (fail_reply(addr), false);
    }
    lock(&shared.registers).insert(addr, value);
    ([addr, REG_ACCESS_OKAY], addr == TRIGGER_REGISTER && value == 1)
}

fn emit_frame(shared: &Shared, stream: &DataStream) {
    let DataStream { socket, dest, plan } = stream;
    let frame_number = shared.next_frame.fetch_add(1, Ordering::Relaxed);
    let builder = FrameBuilder::new(frame_number)
        .events(plan.events)
        .overflow(plan.overflow)
        .words_per_packet(plan.words_per_packet);
    let first = shared.sequence.fetch_add(builder.packet_count() as u32, Ordering::Relaxed);
    let datagrams = builder.first_sequence(first).datagrams();
    match send_datagrams(socket, *dest, &datagrams, plan.packet_gap) {
        Ok(()) => info!(frame = frame_number, packets = datagrams.len(), %dest, "simulated frame sent"),
        Err(e) => warn!(frame = frame_number, error = %e, "simulated frame send failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{has_markers, FrameMetadata};

    #[test]
    fn builder_layout_and_packetization() {
        let b = FrameBuilder::new(7).events(3).overflow(2).words_per_packet(8).first_sequence(100);
        let words = b.frame_words();
        assert_eq!(words.len(), 8 + 12);
        assert_eq!(b.packet_count(), 3);
        let dgrams = b.datagrams();
        assert_eq!(dgrams.len(), 3);
        assert_eq!(&dgrams[0][0..4], &100u32.to_be_bytes());
        assert_eq!(&dgrams[2][0..4], &102u32.to_be_bytes());
        assert_eq!(&dgrams[0][4..8], &[0xFE, 0xED, 0xFA, 0xCE]);
        let last = &dgrams[2];
        assert_eq!(&last[last.len() - 4..], &[0xDE, 0xCA, 0xFB, 0xAD]);

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        assert!(has_markers(&bytes));
        let md = FrameMetadata::from_frame(&bytes);
        assert_eq!((md.frame_number, md.event_count, md.overflow_count), (7, 3, 2));
    }

    #[test]
    fn dropped_packet_keeps_sequence_gap() {
        let b = FrameBuilder::new(1).events(8).words_per_packet(8).drop_packet(1);
        let dgrams = b.datagrams();
        assert_eq!(dgrams.len(), b.packet_count() - 1);
        assert_eq!(&dgrams[1][0..4], &2u32.to_be_bytes());
    }

    #[test]
    fn trigger_register_streams_consecutive_frames() {
        use crate::config::{DataConfig, RegisterConfig};
        use crate::data::DataChannel;
        use crate::frame::FrameBuffer;
        use crate::register::RegisterChannel;

        let mut data = DataChannel::open(&DataConfig { rx_port: 0, recv_buffer_bytes: 1 << 20, ..DataConfig::default() })
            .unwrap();
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, data.local_addr().unwrap().port()));
        let sim = SimulatedModule::spawn(SimConfig {
            data_dest: Some(dest),
            frames: FramePlan { first_frame: 40, events: 10, words_per_packet: 16, ..FramePlan::default() },
            ..SimConfig::ephemeral()
        })
        .unwrap();
        let regs = RegisterChannel::open(&RegisterConfig {
            rx_port: 0,
            read_port: sim.read_addr().port(),
            write_port: sim.write_addr().port(),
            ..RegisterConfig::default()
        })
        .unwrap();

        let mut buf = FrameBuffer::with_capacity(1 << 12);
        regs.write(TRIGGER_REGISTER, 0x1).unwrap();
        data.receive_frame(&mut buf).unwrap();
        assert_eq!(FrameMetadata::from_frame(buf.as_bytes()).frame_number, 40);

        // Writing anything else to the trigger register does not emit a frame.
        regs.write(TRIGGER_REGISTER, 0x0).unwrap();
        assert!(sim.trigger());
        data.receive_frame(&mut buf).unwrap();
        let md = FrameMetadata::from_frame(buf.as_bytes());
        assert_eq!((md.frame_number, md.event_count), (41, 10));
    }

    #[test]
    fn trigger_without_data_destination_is_a_no_op() {
        let sim = SimulatedModule::spawn(SimConfig::ephemeral()).unwrap();
        assert!(!sim.trigger());
    }

    #[test]
    fn odd_packet_size_is_rounded_down() {
        let b = FrameBuilder::new(1).words_per_packet(7);
        assert_eq!(b.words_per_packet, 6);
        let b = FrameBuilder::new(1).words_per_packet(1_000_000);
        assert_eq!(b.words_per_packet, MAX_DATAGRAM_WORDS - 2);
    }
}
