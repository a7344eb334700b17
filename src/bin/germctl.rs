use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crc32fast::Hasher as Crc32;
use dotenvy::dotenv;
use germ_gige::capture::{decode_text, FILENAME_ACK};
use germ_gige::config::{
    parse_subnet, RegisterConfig, DATA_RX_PORT, REGISTER_READ_TX_PORT, REGISTER_WRITE_TX_PORT,
};
use germ_gige::control::{ControlTransport, TcpControlClient};
use germ_gige::frame::{has_markers, FrameMetadata};
use germ_gige::logging;
use germ_gige::register::RegisterChannel;
use germ_gige::shutdown::StopSignal;
use germ_gige::sim::{FramePlan, SimConfig, SimulatedModule};
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "Bench tool for the GeRM UDP interface")]
struct Args {
    /// Module id; the client address is <subnet>.<module-id>
    #[arg(long, env = "GERM_MODULE_ID", default_value_t = 1, global = true)]
    module_id: u8,

    /// Network interface to bind on
    #[arg(long, env = "GERM_IFACE", global = true)]
    iface: Option<String>,

    /// First three octets of the client address
    #[arg(long, env = "GERM_SUBNET", default_value = "127.0.0", value_parser = subnet_arg, global = true)]
    subnet: [u8; 3],

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Read one register
    Read {
        #[arg(value_parser = hex_u32)]
        addr: u32,
    },
    /// Write one register
    Write {
        #[arg(value_parser = hex_u32)]
        addr: u32,
        #[arg(value_parser = hex_u32)]
        value: u32,
    },
    /// Act as the data-collection client and capture frames through a running server
    Capture {
        /// Base filename sent to the server
        base: String,

        /// Number of frames to capture
        #[arg(long, short = 'n', default_value_t = 1)]
        count: usize,

        /// Server control endpoint
        #[arg(long, env = "GERM_CONTROL_CONNECT", default_value = "127.0.0.1:5557")]
        control: String,

        /// Give up on a reply after this many seconds (0 waits forever)
        #[arg(long, default_value_t = 0)]
        timeout_s: u64,
    },
    /// Print metadata of a captured frame file
    Inspect {
        /// Frame file (.bin) to read
        file: PathBuf,
    },
    /// Run a simulated module that answers register commands and streams frames
    Simulate {
        /// Address the simulated module listens on
        #[arg(long, default_value = "127.0.0.1")]
        ip: Ipv4Addr,

        /// Where frames are sent
        #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, DATA_RX_PORT)))]
        data_dest: SocketAddr,

        /// Events per frame
        #[arg(long, default_value_t = 1024)]
        events: usize,

        /// Overflow count reported in each frame
        #[arg(long, default_value_t = 0)]
        overflow: u32,

        /// Payload words per datagram
        #[arg(long, default_value_t = 1024)]
        words_per_packet: usize,

        /// Microseconds between datagrams
        #[arg(long, default_value_t = 0)]
        gap_us: u64,

        /// Also emit a frame every N milliseconds without waiting for the trigger register
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

fn subnet_arg(s: &str) -> Result<[u8; 3], String> {
    parse_subnet(s).ok_or_else(|| format!("expected three dotted octets, got {s:?}"))
}

fn hex_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

fn main() -> Result<()> {
    let _ = dotenv();
    let args = Args::parse();
    logging::init(if matches!(args.cmd, Cmd::Simulate { .. }) { "info" } else { "warn" });

    let reg_cfg = RegisterConfig {
        module_id: args.module_id,
        interface: args.iface.clone(),
        client_subnet: args.subnet,
        ..RegisterConfig::default()
    };
    match args.cmd {
        Cmd::Read { addr } => {
            let regs = RegisterChannel::open(&reg_cfg).context("open register channel")?;
            let value = regs.read(addr).with_context(|| format!("read register {addr:#x}"))?;
            println!("{addr:#010x} = {value:#010x}");
            regs.close();
        }
        Cmd::Write { addr, value } => {
            let regs = RegisterChannel::open(&reg_cfg).context("open register channel")?;
            regs.write(addr, value).with_context(|| format!("write register {addr:#x}"))?;
            println!("{addr:#010x} <- {value:#010x}");
            regs.close();
        }
        Cmd::Capture { base, count, control, timeout_s } => capture(&control, &base, count, timeout_s)?,
        Cmd::Inspect { file } => inspect(&file)?,
        Cmd::Simulate { ip, data_dest, events, overflow, words_per_packet, gap_us, interval_ms } => {
            let config = SimConfig {
                ip,
                read_port: REGISTER_READ_TX_PORT,
                write_port: REGISTER_WRITE_TX_PORT,
                data_dest: Some(data_dest),
                frames: FramePlan {
                    events,
                    overflow,
                    words_per_packet,
                    packet_gap: Duration::from_micros(gap_us),
                    ..FramePlan::default()
                },
            };
            simulate(config, interval_ms.map(Duration::from_millis))?;
        }
    }
    Ok(())
}

/// Drive `count` capture handshakes against the server at `addr`.
fn capture(addr: &str, base: &str, count: usize, timeout_s: u64) -> Result<()> {
    let mut client = TcpControlClient::connect(addr).with_context(|| format!("connect control endpoint {addr}"))?;
    if timeout_s > 0 {
        client.set_read_timeout(Some(Duration::from_secs(timeout_s)))?;
    }
    info!(%addr, count, "connected to capture server");
    for i in 0..count {
        let ack = client.request(base.as_bytes()).context("send filename")?;
        if ack != FILENAME_ACK {
            bail!("unexpected filename ack {:?}", decode_text(&ack));
        }
        let reply = client.request(b"EOF").context("send EOF ack")?;
        let meta = FrameMetadata::from_bytes(&reply).context("decode frame metadata")?;
        let written = decode_text(&client.request(b"Write").context("send write ack")?);
        println!(
            "[{}/{}] frame={} events={} overflows={} file={}",
            i + 1,
            count,
            meta.frame_number,
            meta.event_count,
            meta.overflow_count,
            if written.is_empty() { "<discarded>" } else { written.as_str() }
        );
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let mut rdr = BufReader::new(File::open(path).with_context(|| format!("open {path:?}"))?);
    let mut bytes = Vec::new();
    rdr.read_to_end(&mut bytes).with_context(|| format!("read {path:?}"))?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();
    if bytes.is_empty() {
        println!("{}: empty (damaged-frame placeholder)", path.display());
        return Ok(());
    }
    let meta = FrameMetadata::from_frame(&bytes);
    println!("file:      {}", path.display());
    println!("bytes:     {} ({} words)", bytes.len(), bytes.len() / 2);
    println!("crc32:     {crc:#010x}");
    println!("markers:   {}", if has_markers(&bytes) { "ok" } else { "MISSING" });
    println!("frame:     {}", meta.frame_number);
    println!("events:    {}", meta.event_count);
    println!("overflows: {}", meta.overflow_count);
    Ok(())
}

fn simulate(config: SimConfig, interval: Option<Duration>) -> Result<()> {
    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.trigger()).context("install Ctrl-C handler")?;
    }
    let module = SimulatedModule::spawn(config).context("start simulated module")?;
    eprintln!("simulated module: read {} write {} (Ctrl-C to stop)", module.read_addr(), module.write_addr());

    let tick = Duration::from_millis(100);
    let mut next = interval.map(|d| Instant::now() + d);
    while !stop.is_triggered() {
        std::thread::sleep(tick);
        if let (Some(due), Some(every)) = (next, interval) {
            if Instant::now() >= due {
                module.trigger();
                next = Some(due + every);
            }
        }
    }
    module.shutdown();
    Ok(())
}
