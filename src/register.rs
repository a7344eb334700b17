//! Register read/write over the UDP register protocol.
//!
//! Every command is a datagram of big-endian 32-bit words led by
//! [`MAGIC_KEY`]: `[KEY, addr]` to the client's read port or
//! `[KEY, addr, value]` to its write port. The client answers on our bound
//! receive port with `[status0, status1]`. Each call sends once and waits a
//! bounded time for the reply; retry policy belongs to the caller.
use crate::config::{RegisterConfig, MAGIC_KEY, REG_ACCESS_FAIL, REG_ACCESS_OKAY};
use crate::error::{GermError, Result};
use crate::iface;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Register access as used by the capture orchestrator.
pub trait RegisterAccess {
    fn read(&mut self, addr: u32) -> Result<u32>;
    fn write(&mut self, addr: u32, value: u32) -> Result<()>;
}

/// Result of a bounded wait for socket readability.
#[derive(Debug)]
pub enum WaitOutcome {
    DataReady,
    Timeout,
    Error(io::Error),
}

/// Block until a datagram is queued on `socket` or `timeout` elapses.
/// The datagram is left in the queue.
pub fn wait_readable(socket: &UdpSocket, timeout: Duration) -> WaitOutcome {
    let deadline = Instant::now() + timeout;
    let mut peek_buf = [0u8; 16];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return WaitOutcome::Timeout;
        }
        if let Err(e) = socket.set_read_timeout(Some(remaining)) {
            return WaitOutcome::Error(e);
        }
        match socket.peek_from(&mut peek_buf) {
            Ok(_) => return WaitOutcome::DataReady,
            // SO_RCVTIMEO may fire early on some kernels; re-arm until the deadline.
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => continue,
            Err(e) => return WaitOutcome::Error(e),
        }
    }
}

pub struct RegisterChannel {
    socket: UdpSocket,
    read_dest: SocketAddr,
    write_dest: SocketAddr,
    reply_timeout: Duration,
}

impl RegisterChannel {
    /// Bind the register receive port and resolve the client's destinations.
    pub fn open(config: &RegisterConfig) -> Result<Self> {
        let client = config.client_ip();
        let local = SocketAddrV4::new(iface::bind_address(config.interface.as_deref()), config.rx_port);
        let socket = UdpSocket::bind(local).map_err(|e| {
            error!(%local, error = %e, "register socket bind failed");
            GermError::Io(e)
        })?;
        let ch = Self {
            socket,
            read_dest: SocketAddrV4::new(client, config.read_port).into(),
            write_dest: SocketAddrV4::new(client, config.write_port).into(),
            reply_timeout: config.reply_timeout,
        };
        info!(local = %ch.local_addr()?, read = %ch.read_dest, write = %ch.write_dest, "register channel open");
        Ok(ch)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn read(&self, addr: u32) -> Result<u32> {
        let [status0, status1] = self.transact(&[MAGIC_KEY, addr], self.read_dest)?;
        if status1 == REG_ACCESS_FAIL && status0 >> 24 == 0xFF {
            error!(addr = format_args!("{addr:#x}"), "client asserted register read failure");
            return Err(GermError::RegisterAccessFailure { addr, write: false });
        }
        debug!(addr = format_args!("{addr:#x}"), value = format_args!("{status1:#x}"), "register read");
        Ok(status1)
    }

    pub fn write(&self, addr: u32, value: u32) -> Result<()> {
        let [_, status1] = self.transact(&[MAGIC_KEY, addr, value], self.write_dest)?;
        match status1 {
            REG_ACCESS_OKAY => {
                debug!(addr = format_args!("{addr:#x}"), value = format_args!("{value:#x}"), "register write");
                Ok(())
            }
            REG_ACCESS_FAIL => {
                error!(addr = format_args!("{addr:#x}"), "client asserted register write failure");
                Err(GermError::RegisterAccessFailure { addr, write: true })
            }
            other => {
                error!(addr = format_args!("{addr:#x}"), status = format_args!("{other:#x}"), "unexpected write status");
                Err(GermError::ProtocolViolation(format!("unexpected register write status {other:#010x}")))
            }
        }
    }

    pub fn close(self) {
        debug!("register channel closed");
    }

    fn transact(&self, words: &[u32], dest: SocketAddr) -> Result<[u32; 2]> {
        self.drain_stale()?;
        let msg: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        self.socket.send_to(&msg, dest).map_err(|e| {
            error!(%dest, error = %e, "register command send failed");
            GermError::Io(e)
        })?;

        let deadline = Instant::now() + self.reply_timeout;
        let mut reply = [0u8; 64];
        let (n, from) = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match wait_readable(&self.socket, remaining) {
                WaitOutcome::DataReady => {}
                WaitOutcome::Timeout => {
                    warn!(%dest, timeout = ?self.reply_timeout, "register reply timeout");
                    return Err(GermError::Timeout(self.reply_timeout));
                }
                WaitOutcome::Error(e) => {
                    error!(error = %e, "waiting for register reply failed");
                    return Err(GermError::Io(e));
                }
            }
            let (n, from) = self.socket.recv_from(&mut reply)?;
            if from.ip() == dest.ip() {
                break (n, from);
            }
            warn!(%from, expected = %dest.ip(), len = n, "ignoring datagram from unexpected source");
        };
        if n < 8 {
            error!(%from, len = n, "short register reply");
            return Err(GermError::ProtocolViolation(format!("register reply of {n} bytes, expected 8")));
        }
        let status0 = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
        let status1 = u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]]);
        Ok([status0, status1])
    }

    /// Discard replies left over from earlier requests that timed out.
    fn drain_stale(&self) -> Result<()> {
        self.socket.set_nonblocking(true)?;
        let mut scratch = [0u8; 64];
        let res = loop {
            match self.socket.recv_from(&mut scratch) {
                Ok((n, from)) => debug!(%from, len = n, "dropped stale register reply"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.socket.set_nonblocking(false)?;
        Ok(res?)
    }
}

impl RegisterAccess for RegisterChannel {
    fn read(&mut self, addr: u32) -> Result<u32> {
        RegisterChannel::read(self, addr)
    }

    fn write(&mut self, addr: u32, value: u32) -> Result<()> {
        RegisterChannel::write(self, addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedModule};
    use std::net::Ipv4Addr;

    fn channel_for(sim: &SimulatedModule) -> RegisterChannel {
        let cfg = RegisterConfig {
            rx_port: 0,
            read_port: sim.read_addr().port(),
            write_port: sim.write_addr().port(),
            ..RegisterConfig::default()
        };
        RegisterChannel::open(&cfg).unwrap()
    }

    #[test]
    fn write_then_read_returns_value() {
        let sim = SimulatedModule::spawn(SimConfig::ephemeral()).unwrap();
        let ch = channel_for(&sim);
        for (addr, value) in [(0x1, 0x1), (0x34, 0xDEAD_0001), (0x0FFF_FFFF, 0), (0x36, u32::MAX)] {
            ch.write(addr, value).unwrap();
            assert_eq!(ch.read(addr).unwrap(), value);
        }
        assert_eq!(sim.register(0x34), Some(0xDEAD_0001));
    }

    #[test]
    fn fail_sentinel_surfaces_access_failure() {
        let sim = SimulatedModule::spawn(SimConfig::ephemeral()).unwrap();
        sim.fail_register(0x20);
        let ch = channel_for(&sim);
        match ch.read(0x20) {
            Err(GermError::RegisterAccessFailure { addr: 0x20, write: false }) => {}
            other => panic!("expected read failure, got {other:?}"),
        }
        match ch.write(0x20, 5) {
            Err(GermError::RegisterAccessFailure { addr: 0x20, write: true }) => {}
            other => panic!("expected write failure, got {other:?}"),
        }
        // Other registers are unaffected.
        ch.write(0x21, 5).unwrap();
    }

    #[test]
    fn read_fail_requires_ff_status_byte() {
        // A value that happens to equal the FAIL word is a value, not a failure,
        // unless status0 carries the 0xFF marker.
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let cfg = RegisterConfig {
            rx_port: 0,
            read_port: peer.local_addr().unwrap().port(),
            ..RegisterConfig::default()
        };
        let ch = RegisterChannel::open(&cfg).unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(n, 8);
            assert_eq!(&buf[0..4], &MAGIC_KEY.to_be_bytes());
            let mut reply = 0x0000_0042u32.to_be_bytes().to_vec();
            reply.extend_from_slice(&REG_ACCESS_FAIL.to_be_bytes());
            peer.send_to(&reply, from).unwrap();
        });
        assert_eq!(ch.read(0x42).unwrap(), REG_ACCESS_FAIL);
        handle.join().unwrap();
    }

    #[test]
    fn unexpected_write_status_is_protocol_violation() {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let cfg = RegisterConfig {
            rx_port: 0,
            write_port: peer.local_addr().unwrap().port(),
            ..RegisterConfig::default()
        };
        let ch = RegisterChannel::open(&cfg).unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(n, 12);
            peer.send_to(&[0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78], from).unwrap();
        });
        assert!(matches!(ch.write(1, 1), Err(GermError::ProtocolViolation(_))));
        handle.join().unwrap();
    }

    #[test]
    fn reply_from_foreign_address_is_ignored() {
        // 127.0.0.2 is another loopback address on Linux.
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let stray = UdpSocket::bind((Ipv4Addr::new(127, 0, 0, 2), 0)).unwrap();
        let cfg = RegisterConfig {
            rx_port: 0,
            read_port: peer.local_addr().unwrap().port(),
            ..RegisterConfig::default()
        };
        let ch = RegisterChannel::open(&cfg).unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, from) = peer.recv_from(&mut buf).unwrap();
            let mut forged = 0x0000_0033u32.to_be_bytes().to_vec();
            forged.extend_from_slice(&0xBAD0_BAD0u32.to_be_bytes());
            stray.send_to(&forged, from).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            let mut reply = 0x0000_0033u32.to_be_bytes().to_vec();
            reply.extend_from_slice(&0x1234u32.to_be_bytes());
            peer.send_to(&reply, from).unwrap();
        });
        assert_eq!(ch.read(0x33).unwrap(), 0x1234);
        handle.join().unwrap();
    }

    #[test]
    fn silent_peer_times_out_after_bound() {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = peer.local_addr().unwrap().port();
        let cfg = RegisterConfig { rx_port: 0, read_port: port, write_port: port, ..RegisterConfig::default() };
        let ch = RegisterChannel::open(&cfg).unwrap();

        let start = Instant::now();
        assert!(matches!(ch.read(0x1), Err(GermError::Timeout(_))));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "returned late: {elapsed:?}");

        let start = Instant::now();
        assert!(matches!(ch.write(0x1, 0x1), Err(GermError::Timeout(_))));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3500));
    }

    #[test]
    fn late_reply_is_not_paired_with_next_request() {
        let sim = SimulatedModule::spawn(SimConfig::ephemeral()).unwrap();
        let mut ch = channel_for(&sim);
        ch.reply_timeout = Duration::from_millis(200);
        sim.set_reply_delay(Duration::from_millis(400));
        assert!(matches!(ch.write(0x5, 9), Err(GermError::Timeout(_))));
        sim.set_reply_delay(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(400));
        // The stale OKAY from the write must not be read as the value.
        ch.reply_timeout = Duration::from_secs(3);
        assert_eq!(ch.read(0x5).unwrap(), 9);
    }
}
