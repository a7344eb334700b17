//! Frame reassembly arena, frame metadata and on-disk persistence.
//!
//! A frame is the run of 16-bit words from the SOF datagram through the EOF
//! datagram with each datagram's 4-byte sequence header removed. Words stay
//! in wire (big-endian) byte order in the arena and in the output file:
//!
//! ```text
//! word 0..1   SOF marker 0xFEED 0xFACE
//! word 2..3   frame number (u32)
//! word 4..    event words, 4 per event
//! word n-4..  overflow count (u32)
//! word n-2..  EOF marker 0xDECA 0xFBAD
//! ```
use crate::config::{EOF_MARKER, SOF_MARKER};
use crate::error::{GermError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Capacity-bounded byte arena that holds one frame at a time.
///
/// Allocated once and overwritten in place by every capture cycle.
pub struct FrameBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl FrameBuffer {
    pub fn with_capacity(bytes: usize) -> Self {
        Self { data: vec![0u8; bytes].into_boxed_slice(), len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Used bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn word_count(&self) -> usize {
        self.len / 2
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append at the current offset. Returns false, leaving the buffer
    /// untouched, when `bytes` does not fit.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> bool {
        let end = self.len + bytes.len();
        if end > self.data.len() {
            return false;
        }
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        true
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer").field("capacity", &self.capacity()).field("len", &self.len).finish()
    }
}

/// Big-endian word `index` of a byte slice.
pub fn word_at(bytes: &[u8], index: usize) -> Option<u16> {
    let b = bytes.get(index * 2..index * 2 + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Big-endian u32 spanning words `index` and `index + 1`.
pub fn u32_at(bytes: &[u8], index: usize) -> Option<u32> {
    let hi = word_at(bytes, index)? as u32;
    let lo = word_at(bytes, index + 1)? as u32;
    Some((hi << 16) | lo)
}

/// True when the frame starts with SOF and ends with EOF.
pub fn has_markers(bytes: &[u8]) -> bool {
    let n = bytes.len() / 2;
    n >= 4
        && word_at(bytes, 0) == Some(SOF_MARKER[0])
        && word_at(bytes, 1) == Some(SOF_MARKER[1])
        && word_at(bytes, n - 2) == Some(EOF_MARKER[0])
        && word_at(bytes, n - 1) == Some(EOF_MARKER[1])
}

/// Metadata record sent to the data-collection client after each frame.
/// Serialized as three little-endian u64 (24 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub frame_number: u64,
    pub event_count: u64,
    pub overflow_count: u64,
}

impl FrameMetadata {
    pub const ENCODED_LEN: usize = 24;

    pub fn from_frame(bytes: &[u8]) -> Self {
        let n = bytes.len() / 2;
        let frame_number = u32_at(bytes, 2).unwrap_or(0) as u64;
        let event_count = (n.saturating_sub(8) / 4) as u64;
        let overflow_count = if n >= 4 { u32_at(bytes, n - 4).unwrap_or(0) as u64 } else { 0 };
        Self { frame_number, event_count, overflow_count }
    }

    /// Record reported for a frame that failed reassembly.
    pub fn damaged(frame_number: u32) -> Self {
        Self { frame_number: frame_number as u64, event_count: 0, overflow_count: 0 }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| GermError::ProtocolViolation(format!("encode metadata: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(GermError::ProtocolViolation(format!(
                "metadata record is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        bincode::deserialize(bytes).map_err(|e| GermError::ProtocolViolation(format!("decode metadata: {e}")))
    }
}

/// `<base>_<frame:03>.bin`
pub fn frame_file_name(base: &str, frame_number: u64) -> String {
    format!("{base}_{frame_number:03}.bin")
}

#[derive(Debug, Clone)]
pub struct PersistReport {
    pub path: PathBuf,
    pub bytes: usize,
    pub crc32: u32,
    pub elapsed: Duration,
}

/// Write `bytes` to `path` verbatim, creating missing parent directories.
pub fn persist(bytes: &[u8], path: &Path) -> Result<PersistReport> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let start = Instant::now();
    let file = File::create(path)?;
    let mut w = BufWriter::with_capacity(1 << 20, file);
    w.write_all(bytes)?;
    w.flush()?;
    Ok(PersistReport {
        path: path.to_path_buf(),
        bytes: bytes.len(),
        crc32: crc32fast::hash(bytes),
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn append_respects_capacity() {
        let mut b = FrameBuffer::with_capacity(6);
        assert!(b.append(&[1, 2, 3, 4]));
        assert!(!b.append(&[5, 6, 7]));
        assert_eq!(b.as_bytes(), &[1, 2, 3, 4]);
        assert!(b.append(&[5, 6]));
        assert_eq!(b.word_count(), 3);
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.capacity(), 6);
    }

    #[test]
    fn metadata_from_frame_layout() {
        // SOF, frame 7, two events, overflow 0x0001_0002, EOF
        let mut words = vec![0xFEED, 0xFACE, 0x0000, 0x0007];
        words.extend_from_slice(&[0x0100, 0x0200, 0x0300, 0x0400, 0x0500, 0x0600, 0x0700, 0x0800]);
        words.extend_from_slice(&[0x0001, 0x0002, 0xDECA, 0xFBAD]);
        let bytes = words_to_bytes(&words);
        assert!(has_markers(&bytes));
        let md = FrameMetadata::from_frame(&bytes);
        assert_eq!(md.frame_number, 7);
        assert_eq!(md.event_count, 2);
        assert_eq!(md.overflow_count, 0x0001_0002);
    }

    #[test]
    fn metadata_from_short_frame_does_not_panic() {
        let md = FrameMetadata::from_frame(&[0xFE]);
        assert_eq!(md, FrameMetadata::default());
        assert!(!has_markers(&[]));
    }

    #[test]
    fn metadata_wire_encoding_is_three_le_u64() {
        let md = FrameMetadata { frame_number: 7, event_count: 1, overflow_count: 0x0102 };
        let bytes = md.to_bytes().unwrap();
        assert_eq!(bytes.len(), FrameMetadata::ENCODED_LEN);
        assert_eq!(&bytes[0..8], &7u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x0102u64.to_le_bytes());
        assert_eq!(FrameMetadata::from_bytes(&bytes).unwrap(), md);
        assert!(FrameMetadata::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn file_name_zero_pads_frame_number() {
        assert_eq!(frame_file_name("run42", 7), "run42_007.bin");
        assert_eq!(frame_file_name("scan", 1234), "scan_1234.bin");
    }

    #[test]
    fn persisted_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = FrameBuffer::with_capacity(64);
        assert!(b.append(&words_to_bytes(&[0xFEED, 0xFACE, 0, 3, 0xDECA, 0xFBAD])));
        let path = dir.path().join("nested").join("x_003.bin");
        let report = persist(b.as_bytes(), &path).unwrap();
        assert_eq!(report.bytes, 12);
        assert_eq!(report.crc32, crc32fast::hash(b.as_bytes()));
        assert_eq!(fs::read(&path).unwrap(), b.as_bytes());
    }
}
