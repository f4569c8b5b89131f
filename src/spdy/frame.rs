//! SPDY/3.1 frame layout: parsing and serialization.
//!
//! Every frame starts with an 8-byte header. Control frames set the top bit
//! and carry a version and type; data frames carry the stream id directly.
//! Length is a 24-bit big-endian payload size.

use bytes::{BufMut, Bytes, BytesMut};

use super::SpdyError;

/// SPDY protocol version in every control frame header.
pub const SPDY_VERSION: u16 = 3;

/// Fixed frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// FLAG_FIN: the sender half-closes the stream.
pub const FLAG_FIN: u8 = 0x01;

const TYPE_SYN_STREAM: u16 = 1;
const TYPE_SYN_REPLY: u16 = 2;
const TYPE_RST_STREAM: u16 = 3;
const TYPE_SETTINGS: u16 = 4;
const TYPE_PING: u16 = 6;
const TYPE_GOAWAY: u16 = 7;
const TYPE_HEADERS: u16 = 8;
const TYPE_WINDOW_UPDATE: u16 = 9;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Control frame type, or `None` for a data frame.
    pub control_type: Option<u16>,
    /// Stream id for data frames (zero for control frames).
    pub stream_id: u32,
    /// Frame flags.
    pub flags: u8,
    /// Payload length.
    pub length: usize,
}

/// Parse the fixed 8-byte frame header.
pub fn parse_header(buf: &[u8; FRAME_HEADER_LEN]) -> Result<FrameHeader, SpdyError> {
    let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let flags = buf[4];
    let length = ((buf[5] as usize) << 16) | ((buf[6] as usize) << 8) | buf[7] as usize;

    if word & 0x8000_0000 != 0 {
        let version = ((word >> 16) & 0x7fff) as u16;
        if version != SPDY_VERSION {
            return Err(SpdyError::Protocol(format!(
                "unsupported SPDY version {version}"
            )));
        }
        Ok(FrameHeader {
            control_type: Some((word & 0xffff) as u16),
            stream_id: 0,
            flags,
            length,
        })
    } else {
        Ok(FrameHeader {
            control_type: None,
            stream_id: word & 0x7fff_ffff,
            flags,
            length,
        })
    }
}

/// A frame as seen by the connection driver.
///
/// Only the pieces the port-forward client reacts to are materialized;
/// header blocks on incoming SYN_REPLY/HEADERS frames are discarded by the
/// caller without decompression.
#[derive(Debug)]
pub enum Frame {
    /// Payload bytes on a stream.
    Data {
        /// Stream the bytes belong to.
        stream_id: u32,
        /// Remote half-closed the stream.
        fin: bool,
        /// Payload.
        payload: Bytes,
    },
    /// Remote accepted a stream we opened.
    SynReply {
        /// Stream being acknowledged.
        stream_id: u32,
        /// Remote half-closed the stream.
        fin: bool,
    },
    /// Remote aborted a stream.
    RstStream {
        /// Stream being reset.
        stream_id: u32,
        /// Status code.
        status: u32,
    },
    /// Keep-alive probe; must be echoed verbatim.
    Ping {
        /// Opaque ping id.
        id: u32,
    },
    /// Remote is shutting the connection down.
    GoAway,
    /// Flow-control window replenishment.
    WindowUpdate {
        /// Stream the delta applies to (zero for the session).
        stream_id: u32,
        /// Window increment in bytes.
        delta: u32,
    },
    /// Frames tolerated but not acted on (SETTINGS, HEADERS, unknown types).
    Ignored,
}

/// Decode a control frame from its header and payload.
pub fn decode_control(header: &FrameHeader, payload: &[u8]) -> Result<Frame, SpdyError> {
    let kind = header
        .control_type
        .expect("decode_control called with data frame header");

    let word = |offset: usize| -> Result<u32, SpdyError> {
        payload
            .get(offset..offset + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| SpdyError::Protocol(format!("short control frame (type {kind})")))
    };

    match kind {
        TYPE_SYN_REPLY => Ok(Frame::SynReply {
            stream_id: word(0)? & 0x7fff_ffff,
            fin: header.flags & FLAG_FIN != 0,
        }),
        TYPE_RST_STREAM => Ok(Frame::RstStream {
            stream_id: word(0)? & 0x7fff_ffff,
            status: word(4)?,
        }),
        TYPE_PING => Ok(Frame::Ping { id: word(0)? }),
        TYPE_GOAWAY => Ok(Frame::GoAway),
        TYPE_WINDOW_UPDATE => Ok(Frame::WindowUpdate {
            stream_id: word(0)? & 0x7fff_ffff,
            delta: word(4)? & 0x7fff_ffff,
        }),
        TYPE_SYN_STREAM => Err(SpdyError::Protocol(
            "server-initiated streams are not supported".to_string(),
        )),
        TYPE_SETTINGS | TYPE_HEADERS => Ok(Frame::Ignored),
        _ => Ok(Frame::Ignored),
    }
}

fn put_control_header(out: &mut BytesMut, kind: u16, flags: u8, length: usize) {
    out.put_u32(0x8000_0000 | ((SPDY_VERSION as u32) << 16) | kind as u32);
    out.put_u8(flags);
    out.put_u8(((length >> 16) & 0xff) as u8);
    out.put_u8(((length >> 8) & 0xff) as u8);
    out.put_u8((length & 0xff) as u8);
}

/// Encode a data frame.
pub fn encode_data(out: &mut BytesMut, stream_id: u32, fin: bool, payload: &[u8]) {
    out.put_u32(stream_id & 0x7fff_ffff);
    out.put_u8(if fin { FLAG_FIN } else { 0 });
    out.put_u8(((payload.len() >> 16) & 0xff) as u8);
    out.put_u8(((payload.len() >> 8) & 0xff) as u8);
    out.put_u8((payload.len() & 0xff) as u8);
    out.put_slice(payload);
}

/// Encode a SYN_STREAM frame with an already-compressed header block.
pub fn encode_syn_stream(out: &mut BytesMut, stream_id: u32, fin: bool, header_block: &[u8]) {
    let flags = if fin { FLAG_FIN } else { 0 };
    put_control_header(out, TYPE_SYN_STREAM, flags, 10 + header_block.len());
    out.put_u32(stream_id & 0x7fff_ffff);
    out.put_u32(0); // no associated stream
    out.put_u8(0); // priority and unused bits
    out.put_u8(0); // credential slot
    out.put_slice(header_block);
}

/// Encode a RST_STREAM frame.
pub fn encode_rst_stream(out: &mut BytesMut, stream_id: u32, status: u32) {
    put_control_header(out, TYPE_RST_STREAM, 0, 8);
    out.put_u32(stream_id & 0x7fff_ffff);
    out.put_u32(status);
}

/// Encode a PING frame.
pub fn encode_ping(out: &mut BytesMut, id: u32) {
    put_control_header(out, TYPE_PING, 0, 4);
    out.put_u32(id);
}

/// Encode a GOAWAY frame with status OK.
pub fn encode_goaway(out: &mut BytesMut, last_stream_id: u32) {
    put_control_header(out, TYPE_GOAWAY, 0, 8);
    out.put_u32(last_stream_id & 0x7fff_ffff);
    out.put_u32(0);
}

/// Encode a WINDOW_UPDATE frame.
pub fn encode_window_update(out: &mut BytesMut, stream_id: u32, delta: u32) {
    put_control_header(out, TYPE_WINDOW_UPDATE, 0, 8);
    out.put_u32(stream_id & 0x7fff_ffff);
    out.put_u32(delta & 0x7fff_ffff);
}

/// Serialize a name/value header block in its uncompressed SPDY/3 form.
///
/// Layout: pair count, then length-prefixed name and value for each pair,
/// all 32-bit big-endian. The caller compresses the result.
pub fn encode_header_block(headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    for (name, value) in headers {
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_of(buf: &BytesMut) -> FrameHeader {
        let mut fixed = [0u8; FRAME_HEADER_LEN];
        fixed.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        parse_header(&fixed).unwrap()
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 5, true, b"hello");

        let header = header_of(&buf);
        assert_eq!(header.control_type, None);
        assert_eq!(header.stream_id, 5);
        assert_eq!(header.flags, FLAG_FIN);
        assert_eq!(header.length, 5);
        assert_eq!(&buf[FRAME_HEADER_LEN..], b"hello");
    }

    #[test]
    fn test_syn_stream_layout() {
        let block = encode_header_block(&[("Port".to_string(), "80".to_string())]);
        let mut buf = BytesMut::new();
        encode_syn_stream(&mut buf, 1, false, &block);

        let header = header_of(&buf);
        assert_eq!(header.control_type, Some(TYPE_SYN_STREAM));
        assert_eq!(header.length, 10 + block.len());
        // Stream id directly after the fixed header.
        assert_eq!(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 4], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_rst_stream_roundtrip() {
        let mut buf = BytesMut::new();
        encode_rst_stream(&mut buf, 3, 1);

        let header = header_of(&buf);
        let frame = decode_control(&header, &buf[FRAME_HEADER_LEN..]).unwrap();
        match frame {
            Frame::RstStream { stream_id, status } => {
                assert_eq!(stream_id, 3);
                assert_eq!(status, 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_ping_roundtrip() {
        let mut buf = BytesMut::new();
        encode_ping(&mut buf, 42);

        let header = header_of(&buf);
        match decode_control(&header, &buf[FRAME_HEADER_LEN..]).unwrap() {
            Frame::Ping { id } => assert_eq!(id, 42),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_window_update_roundtrip() {
        let mut buf = BytesMut::new();
        encode_window_update(&mut buf, 7, 65536);

        let header = header_of(&buf);
        match decode_control(&header, &buf[FRAME_HEADER_LEN..]).unwrap() {
            Frame::WindowUpdate { stream_id, delta } => {
                assert_eq!(stream_id, 7);
                assert_eq!(delta, 65536);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_header_block_layout() {
        let block = encode_header_block(&[("Streamtype".to_string(), "data".to_string())]);
        assert_eq!(&block[0..4], &[0, 0, 0, 1]);
        assert_eq!(&block[4..8], &[0, 0, 0, 10]);
        assert_eq!(&block[8..18], b"Streamtype");
        assert_eq!(&block[18..22], &[0, 0, 0, 4]);
        assert_eq!(&block[22..26], b"data");
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        put_control_header(&mut buf, TYPE_PING, 0, 4);
        buf[0] = 0x80;
        buf[1] = 0x02; // SPDY/2
        let mut fixed = [0u8; FRAME_HEADER_LEN];
        fixed.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        assert!(parse_header(&fixed).is_err());
    }

    #[test]
    fn test_settings_ignored() {
        let header = FrameHeader {
            control_type: Some(TYPE_SETTINGS),
            stream_id: 0,
            flags: 0,
            length: 4,
        };
        assert!(matches!(
            decode_control(&header, &[0, 0, 0, 0]).unwrap(),
            Frame::Ignored
        ));
    }
}
