//! Application link framing
//!
//! Applications and the server exchange length-prefixed text frames of the
//! form `<length>#<payload>`, where `<length>` is the decimal byte length of
//! the payload (at most five digits). A payload is a `|` separated meta line,
//! `msgId|type|arg...`, optionally followed by `\r\n` and a free-form body.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::error::LinkError;
use crate::request::InboundRequest;

const MAX_LENGTH_DIGITS: usize = 5;

/// Largest payload representable with the length specifier
pub const MAX_FRAME_LENGTH: usize = 99_999;

const CRLF: &str = "\r\n";

const ROUTE: &str = "route";

/// Codec for `<length>#<payload>` frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_length(src: &mut BytesMut) -> Result<Option<usize>, LinkError> {
        let Some(pos) = src.iter().position(|b| *b == b'#') else {
            if src.len() > MAX_LENGTH_DIGITS || !src.iter().all(u8::is_ascii_digit) {
                return Err(LinkError::Protocol("invalid message length specifier".into()));
            }
            // split in the middle of the length specifier
            return Ok(None);
        };

        let digits = &src[..pos];
        if digits.is_empty()
            || digits.len() > MAX_LENGTH_DIGITS
            || !digits.iter().all(u8::is_ascii_digit)
        {
            return Err(LinkError::Protocol("invalid message length specifier".into()));
        }
        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|len| *len > 0)
            .ok_or_else(|| LinkError::Protocol("invalid message length specifier".into()))?;

        src.advance(pos + 1);
        Ok(Some(len))
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinkError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => match Self::read_length(src)? {
                Some(len) => {
                    self.pending_len = Some(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending_len = None;
        let payload = src.split_to(len);
        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| LinkError::Protocol("frame is not valid utf-8".into()))
    }
}

impl Encoder<String> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, payload: String, dst: &mut BytesMut) -> Result<(), LinkError> {
        if payload.is_empty() {
            return Err(LinkError::Protocol("cannot frame an empty payload".into()));
        }
        if payload.len() > MAX_FRAME_LENGTH {
            return Err(LinkError::TooLarge(payload.len()));
        }
        let prefix = format!("{}#", payload.len());
        dst.reserve(prefix.len() + payload.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_slice(payload.as_bytes());
        Ok(())
    }
}

/// A parsed application frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFrame {
    pub msg_id: String,
    pub kind: String,
    pub args: Vec<String>,
    pub body: Option<String>,
}

impl AppFrame {
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            args,
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn parse(payload: &str) -> Result<Self, LinkError> {
        let (meta, body) = match payload.split_once(CRLF) {
            Some((meta, body)) => (meta, Some(body.to_string())),
            None => (payload, None),
        };
        let mut tokens = meta.split('|').map(str::to_string);
        let msg_id = tokens.next().filter(|id| !id.is_empty());
        let kind = tokens.next().filter(|kind| !kind.is_empty());
        match (msg_id, kind) {
            (Some(msg_id), Some(kind)) => Ok(Self {
                msg_id,
                kind,
                args: tokens.collect(),
                body,
            }),
            _ => Err(LinkError::Protocol(format!("invalid message format: {}", meta))),
        }
    }

    pub fn to_payload(&self) -> String {
        let mut payload = format!("{}|{}", self.msg_id, self.kind);
        for arg in &self.args {
            payload.push('|');
            payload.push_str(arg);
        }
        if let Some(body) = &self.body {
            payload.push_str(CRLF);
            payload.push_str(body);
        }
        payload
    }

    /// `uuid|response|<request msgId>|OK|<reason>` or `...|NO|<reason>`
    pub fn response(request_id: &str, ok: bool, reason: Option<&str>) -> Self {
        let mut args = vec![request_id.to_string(), if ok { "OK" } else { "NO" }.to_string()];
        if let Some(reason) = reason {
            args.push(reason.to_string());
        }
        Self::new("response", args)
    }

    /// Frame delivering a new request to an application
    pub fn sip(request: &InboundRequest) -> Self {
        let source = request
            .source_address
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        Self::new(
            "sip",
            vec![request.transaction_id.clone(), source, request.protocol.clone()],
        )
        .with_body(request.raw_message.clone())
    }

    /// Method subscription sent by an application: `msgId|route|<verb>`
    pub fn route_verb(&self) -> Option<&str> {
        (self.kind == ROUTE).then(|| self.args.first().map(String::as_str).unwrap_or_default())
    }

    /// Whether this is an `OK` response frame
    pub fn is_ok_response(&self) -> bool {
        self.kind == "response" && self.args.get(1).map(String::as_str) == Some("OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frames_split_across_reads() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("1");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"0#abc|auth");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"|x5#hello");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abc|auth|x"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("hello"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_length_specifier() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("12a#xyz");
        assert!(matches!(codec.decode(&mut buf), Err(LinkError::Protocol(_))));

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("123456");
        assert!(matches!(codec.decode(&mut buf), Err(LinkError::Protocol(_))));

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("#abc");
        assert!(matches!(codec.decode(&mut buf), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn test_encode_prefixes_byte_length() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("héllo".to_string(), &mut dst).unwrap();
        assert_eq!(&dst[..], "6#héllo".as_bytes());

        let oversized = "x".repeat(MAX_FRAME_LENGTH + 1);
        assert!(matches!(codec.encode(oversized, &mut dst), Err(LinkError::TooLarge(100_000))));
        assert!(matches!(codec.encode(String::new(), &mut dst), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn test_parse_frame_with_body() {
        let payload = "42|sip|txn-1|10.0.0.1:5060|udp\r\nINVITE sip:a@b SIP/2.0\r\n";
        let frame = AppFrame::parse(payload).unwrap();
        assert_eq!(frame.msg_id, "42");
        assert_eq!(frame.kind, "sip");
        assert_eq!(frame.args, vec!["txn-1", "10.0.0.1:5060", "udp"]);
        assert_eq!(frame.body.as_deref(), Some("INVITE sip:a@b SIP/2.0\r\n"));
        assert_eq!(AppFrame::parse(&frame.to_payload()).unwrap(), frame);

        assert!(AppFrame::parse("only-an-id").is_err());
    }

    #[test]
    fn test_response_frame() {
        let ok = AppFrame::response("7", true, Some("127.0.0.1:5060"));
        assert!(ok.is_ok_response());
        assert_eq!(ok.args, vec!["7", "OK", "127.0.0.1:5060"]);

        let no = AppFrame::response("7", false, Some("incorrect secret"));
        assert!(!no.is_ok_response());
    }

    #[test]
    fn test_route_verb() {
        assert_eq!(AppFrame::parse("9|route|invite").unwrap().route_verb(), Some("invite"));
        assert_eq!(AppFrame::parse("9|route").unwrap().route_verb(), Some(""));
        assert_eq!(AppFrame::parse("9|ping").unwrap().route_verb(), None);
    }
}
