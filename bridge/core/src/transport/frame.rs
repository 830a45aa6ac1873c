//! Frame Protocol
//!
//! Every envelope that crosses a transport is wrapped in a length-prefixed
//! frame carrying a CRC32 checksum of its payload.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | Payload (variable)                       |
//! | big-endian u32 | CRC32          | serialized call or result envelope       |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The Length field contains the size of the payload only.
//! The Checksum is the CRC32 hash of the payload.
//!
//! The socket strategy feeds a byte stream through [`FrameDecoder`]; the file
//! strategy stores exactly one frame per spool file and uses [`decode_frame`].

use super::TransportError;

/// Maximum frame payload size (10 MB)
///
/// This prevents memory exhaustion from corrupted length headers.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 8;

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Parse a header, returning `(payload_len, checksum)`.
fn read_header(header: &[u8]) -> Result<(usize, u32), TransportError> {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Frame(format!(
            "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let checksum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Ok((len, checksum))
}

fn verify(payload: &[u8], expected: u32) -> Result<(), TransportError> {
    let actual = compute_checksum(payload);
    if actual != expected {
        return Err(TransportError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Wrap a payload in a length-prefixed frame with CRC32 checksum
///
/// # Errors
///
/// Returns `TransportError::Frame` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Frame(format!(
            "Frame too large: {} bytes (max: {})",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = payload.len() as u32;
    let checksum = compute_checksum(payload);

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a buffer that must hold exactly one complete frame
///
/// # Errors
///
/// Fails on truncated input, trailing bytes, oversized length headers and
/// checksum mismatches.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    if bytes.len() < HEADER_SIZE {
        return Err(TransportError::Frame(format!(
            "Truncated frame header: {} bytes",
            bytes.len()
        )));
    }
    let (len, checksum) = read_header(&bytes[..HEADER_SIZE])?;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != len {
        return Err(TransportError::Frame(format!(
            "Frame length mismatch: header says {len} bytes, found {}",
            body.len()
        )));
    }
    verify(body, checksum)?;
    Ok(body.to_vec())
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::ChecksumMismatch)` if checksum verification fails
    /// - `Err(...)` if the frame header is invalid
    pub fn decode(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let available = self.available();

        if available < HEADER_SIZE {
            return Ok(None);
        }

        let (len, checksum) = read_header(&self.buffer[self.read_pos..self.read_pos + HEADER_SIZE])?;

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = &self.buffer[payload_start..payload_end];
        verify(payload, checksum)?;
        let payload = payload.to_vec();

        self.read_pos = payload_end;

        Ok(Some(payload))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = br#"{"target":"worker.echo"}"#;

        let encoded = encode_frame(payload).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + payload.len());

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        assert_eq!(decoder.decode().unwrap().unwrap(), payload.to_vec());
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_decode_partial_header() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 0, 0, 5]); // Only length, no checksum
        assert!(matches!(decoder.decode(), Ok(None)));

        let mut decoder2 = FrameDecoder::new();
        decoder2.push(&[0, 0]);
        assert!(matches!(decoder2.decode(), Ok(None)));
    }

    #[test]
    fn test_decode_partial_payload() {
        let encoded = encode_frame(b"split across two reads").unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded[..encoded.len() / 2]);
        assert!(matches!(decoder.decode(), Ok(None)));

        decoder.push(&encoded[encoded.len() / 2..]);
        assert_eq!(
            decoder.decode().unwrap().unwrap(),
            b"split across two reads".to_vec()
        );
    }

    #[test]
    fn test_decode_multiple_frames_in_order() {
        let mut encoded = encode_frame(b"first").unwrap();
        encoded.extend(encode_frame(b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        assert_eq!(decoder.decode().unwrap().unwrap(), b"first".to_vec());
        assert_eq!(decoder.decode().unwrap().unwrap(), b"second".to_vec());
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_empty_payload_frame() {
        let encoded = encode_frame(b"").unwrap();
        assert_eq!(decode_frame(&encoded).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_encode_too_large() {
        let payload = vec![b'x'; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(TransportError::Frame(_))
        ));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut decoder = FrameDecoder::new();

        let huge_len = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        decoder.push(&huge_len);
        decoder.push(&[0u8; 4]);

        assert!(matches!(decoder.decode(), Err(TransportError::Frame(_))));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut decoder = FrameDecoder::new();

        let payload = b"{\"status\":\"ok\"}";
        decoder.push(&(payload.len() as u32).to_be_bytes());
        decoder.push(&0xDEADBEEFu32.to_be_bytes());
        decoder.push(payload);

        assert!(matches!(
            decoder.decode(),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_frame_rejects_truncated_and_trailing_bytes() {
        let encoded = encode_frame(b"exact").unwrap();

        assert!(matches!(
            decode_frame(&encoded[..encoded.len() - 1]),
            Err(TransportError::Frame(_))
        ));

        let mut trailing = encoded.clone();
        trailing.push(0);
        assert!(matches!(
            decode_frame(&trailing),
            Err(TransportError::Frame(_))
        ));

        assert!(matches!(
            decode_frame(&encoded[..3]),
            Err(TransportError::Frame(_))
        ));
    }

    #[test]
    fn test_decode_frame_detects_corruption() {
        let mut encoded = encode_frame(b"payload").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        assert!(matches!(
            decode_frame(&encoded),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decoder_compacts_after_many_frames() {
        let frame = encode_frame(&[7u8; 1024]).unwrap();
        let mut decoder = FrameDecoder::new();
        for _ in 0..16 {
            decoder.push(&frame);
            assert_eq!(decoder.decode().unwrap().unwrap().len(), 1024);
        }
        assert_eq!(decoder.available(), 0);

        decoder.clear();
        assert_eq!(decoder.available(), 0);
    }
}
