//! Wire messages and stream framing.
//!
//! The RPC framing is plain HTTP: unary operations are JSON bodies, and the
//! two chunked operations (store, fetch) are streaming bodies of
//! newline-delimited JSON frames with base64 content. Reassembly of a file is
//! the concatenation of decoded frame contents, in order.

use crate::error::SyncResult;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Observable attributes of one file in the namespace.
///
/// `mtime` is whole-second UNIX time; for a tombstoned file it is the
/// deletion time. `crc_checksum` carries only its three low-order bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: i64,
    pub mtime: i64,
    pub crc_checksum: u32,
    #[serde(default)]
    pub deleted: bool,
}

/// Request body for `POST /fs/acquire`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteAccessRequest {
    pub filename: String,
    pub client_id: String,
}

/// Request body for `POST /fs/delete`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub filename: String,
    pub client_id: String,
}

/// Response for acquire and delete.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn denied(err: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
        }
    }
}

/// Final response of a store stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub success: bool,
}

/// Request body for `POST /fs/files`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListRequest {
    pub client_id: String,
}

/// Response for `POST /fs/files`: the merged live + tombstone listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub files: Vec<FileEntry>,
}

/// One frame of a store or fetch stream.
///
/// Every frame of a store stream carries the same filename and client id;
/// `content` is standard-alphabet base64 of at most one chunk.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub client_id: String,
    pub content: String,
    #[serde(default)]
    pub crc_checksum: u32,
}

impl FileData {
    pub fn new(filename: &str, client_id: &str, chunk: &[u8], crc_checksum: u32) -> Self {
        Self {
            filename: filename.to_string(),
            client_id: client_id.to_string(),
            content: BASE64.encode(chunk),
            crc_checksum,
        }
    }

    /// Decode the chunk bytes carried by this frame.
    pub fn decode_content(&self) -> SyncResult<Vec<u8>> {
        Ok(BASE64.decode(&self.content)?)
    }
}

/// Serialize one message as a newline-terminated JSON frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> SyncResult<Bytes> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Incremental decoder for newline-delimited JSON frames.
///
/// Body bytes arrive in arbitrary splits; push them in as they come and pull
/// complete frames out.
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw body bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, or `None` if no full line is buffered.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> SyncResult<Option<T>> {
        let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = self.buf.split_to(pos + 1);
        let msg = serde_json::from_slice(&line[..line.len() - 1])?;
        Ok(Some(msg))
    }

    /// Decode a trailing frame that was not newline-terminated, if any.
    ///
    /// Call once after the body stream ends.
    pub fn finish<T: DeserializeOwned>(&mut self) -> SyncResult<Option<T>> {
        let rest = self.buf.split();
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&rest)?))
    }
}

/// Whole-second UNIX time for a timestamp.
pub fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = FileData::new("hello.txt", "a", b"hi", 5);
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));

        let mut reader = FrameReader::new();
        reader.push(&bytes);
        let decoded: FileData = reader.next_frame().unwrap().unwrap();
        assert_eq!(decoded.filename, "hello.txt");
        assert_eq!(decoded.client_id, "a");
        assert_eq!(decoded.decode_content().unwrap(), b"hi");
        assert_eq!(decoded.crc_checksum, 5);
    }

    #[test]
    fn test_frame_split_across_pushes() {
        let bytes = encode_frame(&FileData::new("f", "c", b"chunk", 0)).unwrap();
        let mut reader = FrameReader::new();

        reader.push(&bytes[..7]);
        assert!(reader.next_frame::<FileData>().unwrap().is_none());

        reader.push(&bytes[7..]);
        let decoded: FileData = reader.next_frame().unwrap().unwrap();
        assert_eq!(decoded.decode_content().unwrap(), b"chunk");
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut reader = FrameReader::new();
        let mut all = Vec::new();
        for i in 0..3 {
            let frame = FileData::new("f", "c", format!("part{}", i).as_bytes(), 0);
            all.extend_from_slice(&encode_frame(&frame).unwrap());
        }
        reader.push(&all);

        let mut contents = Vec::new();
        while let Some(frame) = reader.next_frame::<FileData>().unwrap() {
            contents.extend(frame.decode_content().unwrap());
        }
        assert_eq!(contents, b"part0part1part2");
    }

    #[test]
    fn test_finish_handles_unterminated_frame() {
        let bytes = encode_frame(&FileData::new("f", "c", b"tail", 0)).unwrap();
        let mut reader = FrameReader::new();
        reader.push(&bytes[..bytes.len() - 1]); // drop the newline
        assert!(reader.next_frame::<FileData>().unwrap().is_none());
        let tail: FileData = reader.finish().unwrap().unwrap();
        assert_eq!(tail.decode_content().unwrap(), b"tail");
        assert!(reader.finish::<FileData>().unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        let mut reader = FrameReader::new();
        reader.push(b"{not json}\n");
        assert!(reader.next_frame::<FileData>().is_err());
    }

    #[test]
    fn test_entry_deleted_defaults_false() {
        let entry: FileEntry = serde_json::from_str(
            r#"{"filename":"a.txt","size":2,"mtime":100,"crc_checksum":3}"#,
        )
        .unwrap();
        assert!(!entry.deleted);
    }
}
