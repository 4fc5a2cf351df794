//! 기본 바이너리 봉투 코덱
//!
//! `[4바이트 메시지 id][4바이트 길이][본문]` (리틀 엔디언) 구조의
//! 길이 접두사 프로토콜입니다. 메시지 id는 문자열 디스패치 키로
//! 노출됩니다.

use anyhow::Result;

use shared::NetError;

use crate::message::{Envelope, EnvelopeCodec};

/// 본문 최대 크기. 이를 넘는 길이 필드는 프로토콜 위반으로 처리합니다.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// 헤더 크기 (id 4바이트 + 길이 4바이트)
pub const HEADER_LEN: usize = 8;

/// 기본 바이너리 봉투
#[derive(Debug, Clone)]
pub struct BinEnvelope {
    id: u32,
    id_str: String,
    body: Vec<u8>,
    text: bool,
}

impl BinEnvelope {
    pub fn new(id: u32, body: Vec<u8>) -> Self {
        Self {
            id,
            id_str: id.to_string(),
            body,
            text: false,
        }
    }

    /// WS 텍스트 프레임에서 만들어진 봉투
    pub fn new_text(id: u32, body: Vec<u8>) -> Self {
        Self {
            id,
            id_str: id.to_string(),
            body,
            text: true,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl Envelope for BinEnvelope {
    fn message_id(&self) -> &str {
        &self.id_str
    }

    fn header(&self) -> String {
        format!("id={} len={}", self.id, self.body.len())
    }

    fn payload(&self) -> &[u8] {
        &self.body
    }

    fn is_text(&self) -> bool {
        self.text
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    fn build_response(&self, msg_id: &str, body: Vec<u8>) -> Option<Box<dyn Envelope>> {
        let id: u32 = msg_id.parse().ok()?;
        let mut resp = BinEnvelope::new(id, body);
        resp.text = self.text;
        Some(Box::new(resp))
    }
}

/// 기본 바이너리 코덱
#[derive(Debug, Default, Clone, Copy)]
pub struct BinCodec;

impl EnvelopeCodec for BinCodec {
    fn decode(&self, buf: &[u8]) -> Result<Option<(Box<dyn Envelope>, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if len > MAX_BODY_LEN {
            return Err(NetError::Protocol(format!("본문 길이 초과: {}", len)).into());
        }
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let body = buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        Ok(Some((Box::new(BinEnvelope::new(id, body)), HEADER_LEN + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let env = BinEnvelope::new(42, b"hello".to_vec());
        let bytes = env.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);

        let (decoded, consumed) = BinCodec.decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.message_id(), "42");
        assert_eq!(decoded.payload(), b"hello");
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let env = BinEnvelope::new(1, b"abcdef".to_vec());
        let bytes = env.encode().unwrap();
        for cut in 0..bytes.len() {
            assert!(BinCodec.decode(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BinEnvelope::new(1, b"a".to_vec()).encode().unwrap();
        buf.extend(BinEnvelope::new(2, b"bb".to_vec()).encode().unwrap());

        let (first, n1) = BinCodec.decode(&buf).unwrap().unwrap();
        assert_eq!(first.message_id(), "1");
        let (second, n2) = BinCodec.decode(&buf[n1..]).unwrap().unwrap();
        assert_eq!(second.message_id(), "2");
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn test_oversized_length_is_protocol_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        assert!(BinCodec.decode(&buf).is_err());
    }

    #[test]
    fn test_build_response_keeps_text_flag() {
        let req = BinEnvelope::new_text(100, b"ping".to_vec());
        let resp = req.build_response("101", b"ping".to_vec()).unwrap();
        assert_eq!(resp.message_id(), "101");
        assert!(resp.is_text());
    }
}
