//! Error type shared by the register channel, the data channel and the
//! capture orchestrator.
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GermError {
    /// No register reply arrived within the bounded wait.
    #[error("no reply from client within {0:?}")]
    Timeout(Duration),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer broke the wire or control protocol (EOF before SOF, short
    /// reply, unexpected status word, bad control frame).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The client asserted the FAIL sentinel for a register access.
    #[error("client asserted register {} failure at {addr:#010x}", access_kind(.write))]
    RegisterAccessFailure { addr: u32, write: bool },

    /// Packet sequence gap inside a frame; the frame was discarded.
    #[error("frame {frame} dropped: missed {missing} packets")]
    FrameIntegrity { frame: u32, missing: u32 },

    /// The frame did not fit in the reassembly arena; the frame was discarded.
    #[error("frame exceeds reassembly buffer capacity of {capacity} bytes")]
    FrameTooLarge { capacity: usize },

    /// The control client hung up, failed mid-exchange or sent a malformed
    /// message. Its connection has been dropped; the next client may connect.
    #[error("control client disconnected")]
    ClientDisconnected,

    /// A stop signal fired while blocked on the socket.
    #[error("receive interrupted by stop signal")]
    Interrupted,
}

fn access_kind(write: &bool) -> &'static str {
    if *write { "write" } else { "read" }
}

pub type Result<T, E = GermError> = std::result::Result<T, E>;

impl GermError {
    /// True for errors after which the frame was read to its EOF datagram but
    /// is unusable. The channel stays in sync and the next cycle can proceed.
    pub fn is_damaged_frame(&self) -> bool {
        matches!(
            self,
            GermError::FrameIntegrity { .. }
                | GermError::FrameTooLarge { .. }
                | GermError::ProtocolViolation(_)
        )
    }
}
