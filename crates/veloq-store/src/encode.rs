//! Record encoding at the append seam.
//!
//! The segment does not define message framing; it hands the encoder a
//! writable window starting at the write position and trusts the returned
//! [`AppendOutcome`]. [`FrameEncoder`] is the stock encoder used by the
//! broker: a length-prefixed, CRC-checked frame, with an end-of-file filler
//! when a record no longer fits so the segment can be rolled.

use crate::error::{Result, StoreError};
use bytes::{BufMut, Bytes};
use chrono::Utc;
use crc32fast::Hasher;
use tracing::warn;

/// Frame header: total_len(4) + magic(4) + crc(4).
pub const FRAME_HEADER_LEN: usize = 12;

/// Marker for a data frame. "VLQR"
pub const RECORD_MAGIC: u32 = 0x564C_5152;

/// Marker for the end-of-file filler closing out a segment. "VLQE"
pub const EOF_MAGIC: u32 = 0x564C_5145;

/// Room reserved so the EOF filler always fits: len(4) + magic(4).
const EOF_FILLER_LEN: usize = 8;

/// Status code of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    /// Record fully encoded.
    Ok,
    /// Not enough room; the remainder was blanked and the segment is full.
    EndOfFile,
    /// Record exceeds the encoder's configured maximum; nothing was written.
    RecordTooLarge,
    /// Segment refused the append (already full or shutting down).
    UnknownError,
}

/// Result of one append, as produced by the encoder.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub status: AppendStatus,
    /// Bytes consumed from the segment, including any EOF filler.
    pub wrote_bytes: usize,
    /// Absolute log offset of the first byte written.
    pub log_offset: u64,
    /// Wall-clock stamp of the append.
    pub store_timestamp_ms: i64,
}

impl AppendOutcome {
    pub fn error(status: AppendStatus) -> Self {
        Self {
            status,
            wrote_bytes: 0,
            log_offset: 0,
            store_timestamp_ms: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AppendStatus::Ok
    }
}

/// Lays a record out into the segment's active buffer.
///
/// `buf` starts at the segment's write position and spans every remaining
/// byte, so `buf.len()` is the room left. The encoder decides how to frame
/// the record and whether it fits; the segment only advances by
/// `wrote_bytes`.
pub trait RecordEncoder {
    type Record: ?Sized;

    fn encode(&self, start_offset: u64, buf: &mut [u8], record: &Self::Record) -> AppendOutcome;
}

/// Stock length-prefixed frame encoder.
///
/// Layout: `[total_len: u32][magic: u32][crc32(payload): u32][payload]`,
/// big-endian. When the remaining room cannot hold the frame plus a future
/// filler header, the remainder is blanked with `[remaining][EOF_MAGIC]` and
/// the outcome reports [`AppendStatus::EndOfFile`].
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_record_bytes: usize,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            max_record_bytes: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl FrameEncoder {
    pub fn new(max_record_bytes: usize) -> Self {
        Self { max_record_bytes }
    }

    /// Parse one frame from `buf`.
    ///
    /// Returns `Ok(None)` at an EOF filler, `Ok(Some((frame_len, payload)))`
    /// for a data frame.
    pub fn read_frame(buf: &[u8]) -> Result<Option<(usize, Bytes)>> {
        if buf.len() < EOF_FILLER_LEN {
            return Err(StoreError::CorruptedFrame(format!(
                "{} bytes left, need at least {}",
                buf.len(),
                EOF_FILLER_LEN
            )));
        }
        let total_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let magic = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if magic == EOF_MAGIC {
            return Ok(None);
        }
        if magic != RECORD_MAGIC {
            return Err(StoreError::CorruptedFrame(format!(
                "bad magic {magic:#010x}"
            )));
        }
        if total_len < FRAME_HEADER_LEN || total_len > buf.len() {
            return Err(StoreError::CorruptedFrame(format!(
                "frame length {} outside [{}, {}]",
                total_len,
                FRAME_HEADER_LEN,
                buf.len()
            )));
        }
        let stored_crc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let payload = &buf[FRAME_HEADER_LEN..total_len];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(StoreError::CorruptedFrame("crc mismatch".to_string()));
        }
        Ok(Some((total_len, Bytes::copy_from_slice(payload))))
    }
}

impl RecordEncoder for FrameEncoder {
    type Record = [u8];

    fn encode(&self, start_offset: u64, buf: &mut [u8], record: &[u8]) -> AppendOutcome {
        if record.len() > self.max_record_bytes {
            warn!(
                len = record.len(),
                max = self.max_record_bytes,
                "record rejected, exceeds frame limit"
            );
            return AppendOutcome::error(AppendStatus::RecordTooLarge);
        }

        let frame_len = FRAME_HEADER_LEN + record.len();
        let remaining = buf.len();

        // Keep room for the filler header of the *next* append, so a segment
        // can always be closed out.
        if frame_len + EOF_FILLER_LEN > remaining {
            if remaining >= EOF_FILLER_LEN {
                let mut cursor = &mut buf[..];
                cursor.put_u32(remaining as u32);
                cursor.put_u32(EOF_MAGIC);
            }
            return AppendOutcome {
                status: AppendStatus::EndOfFile,
                wrote_bytes: remaining,
                log_offset: start_offset,
                store_timestamp_ms: Utc::now().timestamp_millis(),
            };
        }

        let mut hasher = Hasher::new();
        hasher.update(record);
        let crc = hasher.finalize();

        let mut cursor = &mut buf[..];
        cursor.put_u32(frame_len as u32);
        cursor.put_u32(RECORD_MAGIC);
        cursor.put_u32(crc);
        cursor.put_slice(record);

        AppendOutcome {
            status: AppendStatus::Ok,
            wrote_bytes: frame_len,
            log_offset: start_offset,
            store_timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let encoder = FrameEncoder::default();
        let mut buf = vec![0u8; 4096];

        let outcome = encoder.encode(1024, &mut buf, b"hello broker");
        assert_eq!(outcome.status, AppendStatus::Ok);
        assert_eq!(outcome.wrote_bytes, FRAME_HEADER_LEN + 12);
        assert_eq!(outcome.log_offset, 1024);
        assert!(outcome.store_timestamp_ms > 0);

        let (len, payload) = FrameEncoder::read_frame(&buf).unwrap().unwrap();
        assert_eq!(len, outcome.wrote_bytes);
        assert_eq!(&payload[..], b"hello broker");
    }

    #[test]
    fn eof_filler_when_frame_does_not_fit() {
        let encoder = FrameEncoder::default();
        let mut buf = vec![0u8; 20];

        // 12 header + 16 payload + 8 reserve > 20 remaining
        let outcome = encoder.encode(0, &mut buf, &[0xAA; 16]);
        assert_eq!(outcome.status, AppendStatus::EndOfFile);
        assert_eq!(outcome.wrote_bytes, 20);

        assert!(FrameEncoder::read_frame(&buf).unwrap().is_none());
    }

    #[test]
    fn oversized_record_writes_nothing() {
        let encoder = FrameEncoder::new(8);
        let mut buf = vec![0u8; 4096];

        let outcome = encoder.encode(0, &mut buf, &[0xBB; 9]);
        assert_eq!(outcome.status, AppendStatus::RecordTooLarge);
        assert_eq!(outcome.wrote_bytes, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let encoder = FrameEncoder::default();
        let mut buf = vec![0u8; 4096];
        encoder.encode(0, &mut buf, b"payload");

        // Flip a payload byte; the CRC no longer matches.
        buf[FRAME_HEADER_LEN] ^= 0xFF;
        assert!(matches!(
            FrameEncoder::read_frame(&buf),
            Err(StoreError::CorruptedFrame(_))
        ));
    }

    #[test]
    fn consecutive_frames_parse_in_sequence() {
        let encoder = FrameEncoder::default();
        let mut buf = vec![0u8; 4096];

        let first = encoder.encode(0, &mut buf, b"one");
        let second = encoder.encode(
            first.wrote_bytes as u64,
            &mut buf[first.wrote_bytes..],
            b"two",
        );

        let (len, payload) = FrameEncoder::read_frame(&buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"one");
        let (_, payload) = FrameEncoder::read_frame(&buf[len..]).unwrap().unwrap();
        assert_eq!(&payload[..], b"two");
        assert_eq!(second.log_offset, len as u64);
    }
}
