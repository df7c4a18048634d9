//! Length-prefixed framing. Every document on the socket is preceded by one
//! 4-byte little-endian header word: bits 0..29 carry the payload length,
//! bit 30 distinguishes data from meta-data (0 = meta), bit 31 is the ready
//! flag (1 = complete reply, 0 = streaming continuation).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::EngineError;

pub const HEADER_BYTES: usize = 4;
pub const LENGTH_MASK: u32 = 0x3FFF_FFFF;
pub const DATA_BIT: u32 = 1 << 30;
pub const READY_BIT: u32 = 1 << 31;

pub fn header(len: usize, data: bool, ready: bool) -> Result<u32, EngineError> {
    let len = u32::try_from(len)
        .ok()
        .filter(|&l| l <= LENGTH_MASK)
        .ok_or_else(|| EngineError::Codec(format!("frame too large: {len} bytes")))?;
    Ok(len | if data { DATA_BIT } else { 0 } | if ready { READY_BIT } else { 0 })
}

pub fn length(header: u32) -> usize {
    (header & LENGTH_MASK) as usize
}

pub fn is_data(header: u32) -> bool {
    header & DATA_BIT != 0
}

pub fn is_ready(header: u32) -> bool {
    header & READY_BIT != 0
}

/// Append one framed document to an outbound buffer.
pub fn append_frame(
    out: &mut Vec<u8>,
    payload: &[u8],
    data: bool,
    ready: bool,
) -> Result<(), EngineError> {
    let h = header(payload.len(), data, ready)?;
    out.extend_from_slice(&h.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Read one header + payload. Errors on EOF, oversized frames and IO faults.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_payload: usize,
) -> Result<(u32, Vec<u8>), EngineError> {
    let mut head = [0u8; HEADER_BYTES];
    r.read_exact(&mut head).await?;
    let header = u32::from_le_bytes(head);
    let len = length(header);
    if len > max_payload {
        return Err(EngineError::ProtocolViolation(format!(
            "inbound frame of {len} bytes exceeds limit {max_payload}"
        )));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((header, payload))
}

/// Write raw pre-framed bytes.
pub async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<(), EngineError> {
    w.write_all(bytes).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits_round_trip() {
        let h = header(1234, true, false).unwrap();
        assert_eq!(length(h), 1234);
        assert!(is_data(h));
        assert!(!is_ready(h));

        let h = header(0, false, true).unwrap();
        assert_eq!(length(h), 0);
        assert!(!is_data(h));
        assert!(is_ready(h));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        assert!(header(LENGTH_MASK as usize + 1, true, true).is_err());
    }

    #[tokio::test]
    async fn framed_round_trip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut out = Vec::new();
        append_frame(&mut out, b"meta", false, true).unwrap();
        append_frame(&mut out, b"data-part", true, false).unwrap();
        write_all(&mut a, &out).await.unwrap();

        let (h1, p1) = read_frame(&mut b, 1 << 20).await.unwrap();
        assert!(!is_data(h1));
        assert_eq!(p1, b"meta");
        let (h2, p2) = read_frame(&mut b, 1 << 20).await.unwrap();
        assert!(is_data(h2));
        assert!(!is_ready(h2));
        assert_eq!(p2, b"data-part");
    }
}
