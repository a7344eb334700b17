//! Request/reply transport between the capture server and the
//! data-collection client.
//!
//! One request, one reply, strictly alternating. Over TCP each message is
//! framed as `[len:u32 LE][crc32:u32 LE][payload]`.
use crate::error::{GermError, Result};
use crate::shutdown::StopSignal;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reject control messages larger than this.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

pub trait ControlTransport {
    fn recv(&mut self) -> Result<Vec<u8>>;
    fn send(&mut self, msg: &[u8]) -> Result<()>;

    /// Send `msg` and wait for the peer's answer.
    fn request(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
        self.send(msg)?;
        self.recv()
    }
}

pub fn write_message<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(GermError::ProtocolViolation(format!("control message of {} bytes too large", payload.len())));
    }
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&crc32fast::hash(payload).to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_message<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(GermError::ProtocolViolation(format!("control message of {len} bytes too large")));
    }
    r.read_exact(&mut word)?;
    let crc_on_wire = u32::from_le_bytes(word);
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let crc_calc = crc32fast::hash(&payload);
    if crc_calc != crc_on_wire {
        return Err(GermError::ProtocolViolation(format!(
            "control message CRC mismatch: wire={crc_on_wire:#x}, calc={crc_calc:#x}"
        )));
    }
    Ok(payload)
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: SocketAddr,
}

impl Connection {
    fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self { reader: BufReader::new(stream.try_clone()?), writer: BufWriter::new(stream), peer })
    }
}

/// Serves one client connection at a time; a new client may connect once
/// the previous one hangs up.
///
/// Losing the client, or receiving a malformed message from it, drops the
/// connection and surfaces once as [`GermError::ClientDisconnected`] so the
/// caller can abandon whatever exchange was in progress. Only listener
/// failures are returned as I/O errors.
pub struct TcpControlServer {
    listener: TcpListener,
    conn: Option<Connection>,
    stop: Option<StopSignal>,
    poll_interval: Duration,
}

impl TcpControlServer {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(local = %listener.local_addr()?, "control server listening");
        Ok(Self { listener, conn: None, stop: None, poll_interval: Duration::from_millis(250) })
    }

    /// Make idle waits return [`GermError::Interrupted`] once `stop` fires.
    pub fn with_stop(mut self, stop: StopSignal) -> Result<Self> {
        self.listener.set_nonblocking(true)?;
        self.stop = Some(stop);
        Ok(self)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_triggered)
    }

    fn accept(&mut self) -> Result<Connection> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    info!(%peer, "control client connected");
                    return Connection::new(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.stopped() {
                        return Err(GermError::Interrupted);
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait until the client has sent something. Returns false if it hung up.
    fn wait_for_request(&self, conn: &mut Connection) -> Result<bool> {
        if !conn.reader.buffer().is_empty() {
            return Ok(true);
        }
        if self.stop.is_none() {
            return Ok(true);
        }
        let stream = conn.reader.get_ref();
        stream.set_read_timeout(Some(self.poll_interval))?;
        let mut peek_buf = [0u8; 1];
        let ready = loop {
            match stream.peek(&mut peek_buf) {
                Ok(0) => break false,
                Ok(_) => break true,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.stopped() {
                        return Err(GermError::Interrupted);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_read_timeout(None)?;
        Ok(ready)
    }
}

impl ControlTransport for TcpControlServer {
    fn recv(&mut self) -> Result<Vec<u8>> {
        let mut conn = match self.conn.take() {
            Some(c) => c,
            None => self.accept()?,
        };
        let request = match self.wait_for_request(&mut conn) {
            Ok(true) => read_message(&mut conn.reader),
            Ok(false) => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Err(e) => Err(e),
        };
        match request {
            Ok(msg) => {
                debug!(peer = %conn.peer, len = msg.len(), "control request");
                self.conn = Some(conn);
                Ok(msg)
            }
            Err(GermError::Interrupted) => {
                self.conn = Some(conn);
                Err(GermError::Interrupted)
            }
            Err(GermError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!(peer = %conn.peer, "control client disconnected");
                Err(GermError::ClientDisconnected)
            }
            Err(e) => {
                warn!(peer = %conn.peer, error = %e, "dropping control client");
                Err(GermError::ClientDisconnected)
            }
        }
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(GermError::Io(io::Error::new(io::ErrorKind::NotConnected, "no control client connected")));
        };
        if let Err(e) = write_message(&mut conn.writer, msg) {
            warn!(peer = %conn.peer, error = %e, "control reply failed; dropping client");
            self.conn = None;
            return Err(GermError::ClientDisconnected);
        }
        Ok(())
    }
}

/// Client side of [`TcpControlServer`].
pub struct TcpControlClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TcpControlClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { reader: BufReader::new(stream.try_clone()?), writer: BufWriter::new(stream) })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.reader.get_ref().set_read_timeout(timeout)?)
    }
}

impl ControlTransport for TcpControlClient {
    fn recv(&mut self) -> Result<Vec<u8>> {
        read_message(&mut self.reader)
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        write_message(&mut self.writer, msg)
    }
}

/// In-process transport; `pair()` returns two connected ends.
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

fn hung_up() -> GermError {
    GermError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "control peer hung up"))
}

impl ControlTransport for ChannelTransport {
    fn recv(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| hung_up())
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        self.tx.send(msg.to_vec()).map_err(|_| hung_up())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn framing_checks_crc() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"run42").unwrap();
        assert_eq!(buf.len(), 8 + 5);
        assert_eq!(read_message(&mut Cursor::new(&buf)).unwrap(), b"run42");

        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(read_message(&mut Cursor::new(&buf)), Err(GermError::ProtocolViolation(_))));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = ((MAX_MESSAGE_BYTES + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 4]);
        assert!(matches!(read_message(&mut Cursor::new(&buf)), Err(GermError::ProtocolViolation(_))));
    }

    #[test]
    fn channel_pair_alternates() {
        let (mut a, mut b) = ChannelTransport::pair();
        a.send(b"ping").unwrap();
        assert_eq!(b.recv().unwrap(), b"ping");
        b.send(b"pong").unwrap();
        assert_eq!(a.recv().unwrap(), b"pong");
        drop(b);
        assert!(a.recv().is_err());
    }

    /// Answer `count` requests with "ack <request>", skipping over dropped clients.
    fn serve_acks(server: &mut TcpControlServer, count: usize) -> usize {
        let mut dropped = 0;
        let mut served = 0;
        while served < count {
            match server.recv() {
                Ok(msg) => {
                    let mut reply = b"ack ".to_vec();
                    reply.extend_from_slice(&msg);
                    server.send(&reply).unwrap();
                    served += 1;
                }
                Err(GermError::ClientDisconnected) => dropped += 1,
                Err(e) => panic!("server failed: {e}"),
            }
        }
        dropped
    }

    #[test]
    fn tcp_server_survives_client_reconnect() {
        let mut server = TcpControlServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut c = TcpControlClient::connect(addr).unwrap();
            assert_eq!(c.request(b"first").unwrap(), b"ack first");
            drop(c);
            let mut c = TcpControlClient::connect(addr).unwrap();
            assert_eq!(c.request(b"second").unwrap(), b"ack second");
        });
        assert_eq!(serve_acks(&mut server, 2), 1);
        client.join().unwrap();
    }

    #[test]
    fn malformed_message_drops_only_that_client() {
        let mut server = TcpControlServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut raw = TcpStream::connect(addr).unwrap();
            raw.write_all(&4u32.to_le_bytes()).unwrap();
            raw.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
            raw.write_all(b"run1").unwrap();
            let mut c = TcpControlClient::connect(addr).unwrap();
            assert_eq!(c.request(b"run2").unwrap(), b"ack run2");
            drop(raw);
        });
        assert_eq!(serve_acks(&mut server, 1), 1);
        client.join().unwrap();
    }

    #[test]
    fn idle_server_honors_stop() {
        let stop = StopSignal::new();
        let mut server = TcpControlServer::bind("127.0.0.1:0").unwrap().with_stop(stop.clone()).unwrap();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            stop.trigger();
        });
        assert!(matches!(server.recv(), Err(GermError::Interrupted)));
        t.join().unwrap();
    }

    #[test]
    fn send_without_client_fails() {
        let mut server = TcpControlServer::bind("127.0.0.1:0").unwrap();
        assert!(matches!(server.send(b"x"), Err(GermError::Io(_))));
    }
}
