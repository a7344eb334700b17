//! Wire constants and per-endpoint configuration.
//!
//! The FPGA-side client listens for register commands on two fixed ports and
//! answers on a third; frame data arrives on a fourth. The client's IPv4
//! address is the configured subnet with the module id as the last octet.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Key sent ahead of every register command.
pub const MAGIC_KEY: u32 = 0xDEAD_BEEF;

/// Client port receiving register write commands.
pub const REGISTER_WRITE_TX_PORT: u16 = 0x7D00;
/// Client port receiving register read commands.
pub const REGISTER_READ_TX_PORT: u16 = 0x7D01;
/// Local port the client sends register replies to.
pub const REGISTER_RX_PORT: u16 = 0x7D02;
/// Local port the client streams frame data to.
pub const DATA_RX_PORT: u16 = 0x7D03;

pub const SOF_MARKER: [u16; 2] = [0xFEED, 0xFACE];
pub const EOF_MARKER: [u16; 2] = [0xDECA, 0xFBAD];

/// Status word meaning the register access succeeded ("Okay").
pub const REG_ACCESS_OKAY: u32 = 0x4F6B_6179;
/// Status word meaning the register access failed ("Fail").
pub const REG_ACCESS_FAIL: u32 = 0x4661_696C;

pub const REGISTER_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest data datagram, in 16-bit words.
pub const MAX_DATAGRAM_WORDS: usize = 4096;
/// Per-datagram header carrying the packet sequence number.
pub const DATA_HEADER_BYTES: usize = 4;
/// Requested SO_RCVBUF for the data socket.
pub const DATA_RECV_BUFFER_BYTES: usize = 500_000_000;

/// Register that gates the UDP interface on the client.
pub const UDP_ENABLE_REGISTER: u32 = 0x1;

/// Lab-bench default; hardware deployments use 10.0.143.
pub const DEFAULT_CLIENT_SUBNET: [u8; 3] = [127, 0, 0];
pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:5557";
pub const DEFAULT_FRAME_BUFFER_BYTES: usize = 1 << 30;

/// Client address for `module_id` on `subnet`.
pub fn client_addr(subnet: [u8; 3], module_id: u8) -> Ipv4Addr {
    Ipv4Addr::new(subnet[0], subnet[1], subnet[2], module_id)
}

/// Parse a dotted three-octet subnet such as `10.0.143`.
pub fn parse_subnet(s: &str) -> Option<[u8; 3]> {
    let mut out = [0u8; 3];
    let mut parts = s.trim().split('.');
    for slot in out.iter_mut() {
        *slot = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[derive(Debug, Clone)]
pub struct RegisterConfig {
    pub module_id: u8,
    /// Interface to bind on; `None` or an unknown name binds the wildcard.
    pub interface: Option<String>,
    pub client_subnet: [u8; 3],
    pub rx_port: u16,
    pub read_port: u16,
    pub write_port: u16,
    pub reply_timeout: Duration,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            module_id: 1,
            interface: None,
            client_subnet: DEFAULT_CLIENT_SUBNET,
            rx_port: REGISTER_RX_PORT,
            read_port: REGISTER_READ_TX_PORT,
            write_port: REGISTER_WRITE_TX_PORT,
            reply_timeout: REGISTER_REPLY_TIMEOUT,
        }
    }
}

impl RegisterConfig {
    pub fn client_ip(&self) -> Ipv4Addr {
        client_addr(self.client_subnet, self.module_id)
    }
}

#[derive(Debug, Clone)]
pub struct DataConfig {
    pub module_id: u8,
    pub interface: Option<String>,
    pub client_subnet: [u8; 3],
    pub rx_port: u16,
    pub recv_buffer_bytes: usize,
    /// Read timeout used to poll a stop signal while blocked on the socket.
    pub poll_interval: Duration,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            module_id: 1,
            interface: None,
            client_subnet: DEFAULT_CLIENT_SUBNET,
            rx_port: DATA_RX_PORT,
            recv_buffer_bytes: DATA_RECV_BUFFER_BYTES,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl DataConfig {
    pub fn client_ip(&self) -> Ipv4Addr {
        client_addr(self.client_subnet, self.module_id)
    }
}

/// What to do with a frame that failed reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DamagedFramePolicy {
    /// Write nothing and answer the write-complete ack with an empty name.
    #[default]
    Discard,
    /// Create a zero-length file so the run has a placeholder per trigger.
    EmptyFile,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Directory that relative base filenames from the client resolve under.
    pub output_dir: PathBuf,
    pub damaged_frames: DamagedFramePolicy,
    /// Issue the UDP-enable register write before serving requests.
    pub enable_udp: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            damaged_frames: DamagedFramePolicy::Discard,
            enable_udp: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_address_appends_module_id() {
        assert_eq!(client_addr([10, 0, 143], 3), Ipv4Addr::new(10, 0, 143, 3));
        assert_eq!(RegisterConfig::default().client_ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn subnet_parsing() {
        assert_eq!(parse_subnet("10.0.143"), Some([10, 0, 143]));
        assert_eq!(parse_subnet(" 127.0.0 "), Some([127, 0, 0]));
        assert_eq!(parse_subnet("10.0"), None);
        assert_eq!(parse_subnet("10.0.143.1"), None);
        assert_eq!(parse_subnet("10.0.300"), None);
    }

    #[test]
    fn ports_match_wire_protocol() {
        assert_eq!(REGISTER_WRITE_TX_PORT, 32000);
        assert_eq!(REGISTER_READ_TX_PORT, 32001);
        assert_eq!(REGISTER_RX_PORT, 32002);
        assert_eq!(DATA_RX_PORT, 32003);
    }
}
