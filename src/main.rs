use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use germ_gige::capture::CaptureOrchestrator;
use germ_gige::config::{
    parse_subnet, CaptureConfig, DamagedFramePolicy, DataConfig, RegisterConfig, DATA_RECV_BUFFER_BYTES,
    DEFAULT_CONTROL_ADDR,
};
use germ_gige::control::TcpControlServer;
use germ_gige::data::DataChannel;
use germ_gige::frame::FrameBuffer;
use germ_gige::logging;
use germ_gige::register::RegisterChannel;
use germ_gige::shutdown::StopSignal;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "GeRM frame capture server (UDP register + data interface)")]
struct Args {
    /// Module id; the client address is <subnet>.<module-id>
    #[arg(long, env = "GERM_MODULE_ID", default_value_t = 1)]
    module_id: u8,

    /// Network interface to bind on (wildcard if unset or unknown)
    #[arg(long, env = "GERM_IFACE")]
    iface: Option<String>,

    /// First three octets of the client address
    #[arg(long, env = "GERM_SUBNET", default_value = "127.0.0", value_parser = subnet_arg)]
    subnet: [u8; 3],

    /// Control endpoint the data-collection client connects to
    #[arg(long, env = "GERM_CONTROL_ADDR", default_value = DEFAULT_CONTROL_ADDR)]
    control: String,

    /// Directory for relative base filenames
    #[arg(long, env = "GERM_OUT_DIR", default_value = ".")]
    out_dir: PathBuf,

    /// Reassembly buffer size in MiB (largest frame the server accepts)
    #[arg(long, env = "GERM_BUFFER_MB", default_value_t = 1024)]
    buffer_mb: usize,

    /// Requested OS receive buffer for the data socket, in bytes
    #[arg(long, env = "GERM_RCVBUF", default_value_t = DATA_RECV_BUFFER_BYTES)]
    rcvbuf: usize,

    /// What to write for frames that fail reassembly
    #[arg(long, env = "GERM_DAMAGED", value_enum, default_value_t = DamagedFramePolicy::Discard)]
    damaged: DamagedFramePolicy,

    /// Do not write the UDP-enable register at startup
    #[arg(long, default_value_t = false)]
    no_enable: bool,
}

fn subnet_arg(s: &str) -> Result<[u8; 3], String> {
    parse_subnet(s).ok_or_else(|| format!("expected three dotted octets, got {s:?}"))
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    logging::init("info");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.trigger()).context("install Ctrl-C handler")?;
    }

    let reg_cfg = RegisterConfig {
        module_id: args.module_id,
        interface: args.iface.clone(),
        client_subnet: args.subnet,
        ..RegisterConfig::default()
    };
    let data_cfg = DataConfig {
        module_id: args.module_id,
        interface: args.iface.clone(),
        client_subnet: args.subnet,
        recv_buffer_bytes: args.rcvbuf,
        ..DataConfig::default()
    };

    let mut regs = RegisterChannel::open(&reg_cfg).context("open register channel")?;
    let data = DataChannel::open(&data_cfg).context("open data channel")?.with_stop(stop.clone())?;
    let control = TcpControlServer::bind(args.control.as_str())
        .with_context(|| format!("bind control endpoint {}", args.control))?
        .with_stop(stop.clone())?;

    info!(mib = args.buffer_mb, "allocating frame buffer");
    let buffer = FrameBuffer::with_capacity(args.buffer_mb << 20);
    let capture_cfg = CaptureConfig { output_dir: args.out_dir, damaged_frames: args.damaged, enable_udp: !args.no_enable };
    let mut orchestrator = CaptureOrchestrator::new(control, data, buffer, capture_cfg);

    if !orchestrator.enable_udp(&mut regs) && !args.no_enable {
        warn!("module UDP interface may be disabled; frames will not arrive until it is enabled");
    }

    orchestrator.run(&stop).context("capture loop")?;
    regs.close();
    Ok(())
}
