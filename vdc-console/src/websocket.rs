//! Server-side RFC 6455 framing.
//!
//! Only what the console endpoint needs: the upgrade handshake, frame
//! encode (server to client, unmasked) and a buffered frame decoder for
//! masked client frames. Extensions and fragmentation of control frames are
//! rejected per the RFC.

use anyhow::{bail, format_err, Error};
use http::header::{HeaderMap, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Global identifier for WebSockets, see RFC 6455.
pub const MAGIC_WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Close status codes used by the console endpoint (RFC 6455 section 7.4.1).
#[derive(Debug, Clone, Copy)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    ProtocolError = 1002,
    /// Sent to clients that cannot keep up with console output.
    Policy = 1008,
    Unexpected = 1011,
}

impl CloseCode {
    pub fn to_be_bytes(self) -> [u8; 2] {
        (self as u16).to_be_bytes()
    }
}

#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpCode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        (self as u8 & 0b1000) > 0
    }

    fn from_bits(bits: u8) -> Result<Self, Error> {
        Ok(match bits {
            0 => OpCode::Continuation,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            other => bail!("unknown websocket opcode {other}"),
        })
    }
}

fn apply_mask(mask: [u8; 4], data: &mut [u8]) {
    if mask == [0u8; 4] {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Encode one complete, unmasked frame (we are the server).
pub fn encode_frame(opcode: OpCode, data: &[u8]) -> Result<Vec<u8>, Error> {
    if opcode.is_control() && data.len() > 125 {
        bail!("control frames cannot carry more than 125 bytes");
    }

    let len = data.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(0b1000_0000 | (opcode as u8));

    if len < 126 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(data);
    Ok(frame)
}

/// Encode a close frame with a status code and a short reason.
pub fn encode_close(code: CloseCode, reason: &str) -> Result<Vec<u8>, Error> {
    let reason = &reason.as_bytes()[..reason.len().min(123)];
    let mut payload = Vec::with_capacity(reason.len() + 2);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason);
    encode_frame(OpCode::Close, &payload)
}

/// A parsed frame header.
#[derive(Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub fin: bool,
    pub mask: Option<[u8; 4]>,
    pub opcode: OpCode,
    pub header_len: usize,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parse a header from the start of `data`; `None` when more bytes are
    /// needed.
    pub fn try_from_bytes(data: &[u8]) -> Result<Option<FrameHeader>, Error> {
        if data.len() < 2 {
            return Ok(None);
        }

        if data[0] & 0b0111_0000 != 0 {
            bail!("websocket extensions are not supported");
        }

        let fin = data[0] & 0b1000_0000 != 0;
        let opcode = OpCode::from_bits(data[0] & 0b1111)?;
        if !fin && opcode.is_control() {
            bail!("control frames cannot be fragmented");
        }

        let masked = data[1] & 0b1000_0000 != 0;
        let mut offset = 2usize;

        let mut payload_len = (data[1] & 0b0111_1111) as usize;
        if payload_len == 126 {
            if data.len() < 4 {
                return Ok(None);
            }
            payload_len = u16::from_be_bytes([data[2], data[3]]) as usize;
            offset += 2;
        } else if payload_len == 127 {
            if data.len() < 10 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[2..10]);
            payload_len = u64::from_be_bytes(bytes) as usize;
            offset += 8;
        }

        if opcode.is_control() && payload_len > 125 {
            bail!("oversized control frame");
        }

        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mut mask = [0u8; 4];
            mask.copy_from_slice(&data[offset..offset + 4]);
            offset += 4;
            Some(mask)
        } else {
            None
        };

        Ok(Some(FrameHeader {
            fin,
            mask,
            opcode,
            header_len: offset,
            payload_len,
        }))
    }
}

/// A complete frame delivered by [`FrameReader`].
#[derive(Debug)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Buffered frame decoder over any byte reader.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            max_payload: 1 << 20,
        }
    }

    /// Read the next complete frame, unmasking the payload. `None` on EOF
    /// at a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(header) = FrameHeader::try_from_bytes(&self.buf)? {
                if header.payload_len > self.max_payload {
                    bail!("oversized websocket frame ({} bytes)", header.payload_len);
                }
                if self.buf.len() >= header.header_len + header.payload_len {
                    let mut rest = self.buf.split_off(header.header_len + header.payload_len);
                    std::mem::swap(&mut self.buf, &mut rest);
                    let mut payload = rest.split_off(header.header_len);
                    if let Some(mask) = header.mask {
                        apply_mask(mask, &mut payload);
                    }
                    return Ok(Some(Frame {
                        opcode: header.opcode,
                        payload,
                    }));
                }
            }

            let mut chunk = [0u8; 4096];
            let read = self.reader.read(&mut chunk).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed inside a websocket frame");
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Compute the `Sec-WebSocket-Accept` response headers for an upgrade
/// request, validating the client handshake.
pub fn handshake_response(headers: &HeaderMap<HeaderValue>) -> Result<HeaderValue, Error> {
    use http::header::{SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};

    let upgrade = headers
        .get(UPGRADE)
        .ok_or_else(|| format_err!("missing Upgrade header"))?
        .to_str()?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        bail!("invalid upgrade protocol '{upgrade}'");
    }

    let version = headers
        .get(SEC_WEBSOCKET_VERSION)
        .ok_or_else(|| format_err!("missing websocket version"))?
        .to_str()?;
    if version != "13" {
        bail!("unsupported websocket version '{version}'");
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| format_err!("missing websocket key"))?
        .to_str()?;

    let mut sha1 = openssl::sha::Sha1::new();
    sha1.update(format!("{key}{MAGIC_WEBSOCKET_GUID}").as_bytes());
    let accept = base64_encode(&sha1.finish());
    Ok(HeaderValue::from_str(&accept)?)
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = u32::from_be_bytes([0, b[0], b[1], b[2]]);
        out.push(BASE64_ALPHABET[(n >> 18 & 63) as usize] as char);
        out.push(BASE64_ALPHABET[(n >> 12 & 63) as usize] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(n >> 6 & 63) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[(n & 63) as usize] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple_frame() {
        let frame = encode_frame(OpCode::Text, &[0, 1, 2, 3, 4]).unwrap();
        assert_eq!(frame, vec![0b1000_0001, 5, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn encode_control_frame_limit() {
        assert!(encode_frame(OpCode::Ping, &[0u8; 126]).is_err());
        assert!(encode_frame(OpCode::Binary, &[0u8; 126]).is_ok());
    }

    #[test]
    fn header_round_trip() {
        let frame = encode_frame(OpCode::Ping, &[0, 1, 2, 3]).unwrap();
        assert_eq!(FrameHeader::try_from_bytes(&frame[..1]).unwrap(), None);
        let header = FrameHeader::try_from_bytes(&frame).unwrap().unwrap();
        assert_eq!(
            header,
            FrameHeader {
                fin: true,
                mask: None,
                opcode: OpCode::Ping,
                header_len: 2,
                payload_len: 4,
            }
        );
    }

    #[test]
    fn extended_lengths() {
        let frame = encode_frame(OpCode::Binary, &vec![7u8; 300]).unwrap();
        let header = FrameHeader::try_from_bytes(&frame).unwrap().unwrap();
        assert_eq!(header.header_len, 4);
        assert_eq!(header.payload_len, 300);

        let frame = encode_frame(OpCode::Binary, &vec![7u8; 70000]).unwrap();
        let header = FrameHeader::try_from_bytes(&frame).unwrap().unwrap();
        assert_eq!(header.header_len, 10);
        assert_eq!(header.payload_len, 70000);
    }

    #[tokio::test]
    async fn frame_reader_unmasks_client_frames() {
        // hand-build a masked client frame for "ping"
        let mask = [1u8, 2, 3, 4];
        let mut payload = b"ping".to_vec();
        apply_mask(mask, &mut payload);
        let mut wire = vec![0b1000_0001, 0b1000_0100];
        wire.extend_from_slice(&mask);
        wire.extend_from_slice(&payload);

        let mut reader = FrameReader::new(std::io::Cursor::new(wire));
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"ping");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_reader_handles_coalesced_frames() {
        let mut wire = encode_frame(OpCode::Text, b"one").unwrap();
        wire.extend(encode_frame(OpCode::Text, b"two").unwrap());

        let mut reader = FrameReader::new(std::io::Cursor::new(wire));
        assert_eq!(reader.next_frame().await.unwrap().unwrap().payload, b"one");
        assert_eq!(reader.next_frame().await.unwrap().unwrap().payload, b"two");
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(http::header::SEC_WEBSOCKET_VERSION, "13".parse().unwrap());
        headers.insert(
            http::header::SEC_WEBSOCKET_KEY,
            "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap(),
        );
        let accept = handshake_response(&headers).unwrap();
        // expected value from RFC 6455 section 1.3
        assert_eq!(accept, "s3pcPLgOKiM2/k0IvNDTIA+mOzQ=");
    }

    #[test]
    fn rejects_broken_handshakes() {
        let mut headers = HeaderMap::new();
        assert!(handshake_response(&headers).is_err());

        headers.insert(http::header::UPGRADE, "h2c".parse().unwrap());
        headers.insert(http::header::SEC_WEBSOCKET_VERSION, "13".parse().unwrap());
        headers.insert(http::header::SEC_WEBSOCKET_KEY, "x".parse().unwrap());
        assert!(handshake_response(&headers).is_err());
    }
}
