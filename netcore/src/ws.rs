//! WebSocket 어댑터
//!
//! 수락된 연결 위에서 RFC 6455 서버 측 핸드셰이크와 프레임 변환을
//! 수행합니다. 업그레이드 완료 후 바이너리 프레임은 내부 바이트
//! 파이프라인(원시 TCP와 같은 경로)으로 전달되고, 텍스트 프레임은
//! "text" 컨텍스트 플래그와 함께 전달됩니다.
//!
//! ping은 pong으로 자동 응답하고, close는 연결을 종료하며, pong은
//! 무시합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};

use shared::NetError;

/// RFC 6455 핸드셰이크 GUID
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// 프레임 페이로드 상한
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// 데이터/제어 프레임 opcode
pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// 프레임 파싱 결과
#[derive(Debug, PartialEq, Eq)]
pub enum WsEvent {
    /// 완성된 데이터 메시지 (조각 모음 완료)
    Message { text: bool, payload: Vec<u8> },
    /// ping 수신: payload를 pong으로 돌려보내야 함
    Ping(Vec<u8>),
    /// pong 수신: 무시
    Pong,
    /// close 수신: 연결 종료
    Close,
    /// 조각 프레임 소비됨, 완성된 메시지는 아직 없음
    Partial,
}

/// 수락된 연결 하나의 WebSocket 세션
pub struct WsSession {
    handshake_done: AtomicBool,
    response_headers: HashMap<String, Vec<String>>,
    real_addr: RwLock<Option<String>>,
    /// 진행 중인 조각 메시지: (텍스트 여부, 누적 페이로드)
    frag: Mutex<Option<(bool, Vec<u8>)>>,
}

impl WsSession {
    pub fn new(response_headers: HashMap<String, Vec<String>>) -> Self {
        Self {
            handshake_done: AtomicBool::new(false),
            response_headers,
            real_addr: RwLock::new(None),
            frag: Mutex::new(None),
        }
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done.load(Ordering::Acquire)
    }

    /// 업그레이드 헤더에서 추출한 실제 원격 주소
    ///
    /// 우선순위: X-Forwarded-For 첫 홉 > X-Real-IP > 소켓 주소(None 반환).
    pub fn real_addr(&self) -> Option<String> {
        self.real_addr.read().clone()
    }

    /// HTTP 업그레이드 요청 파싱 시도.
    ///
    /// 요청이 아직 완전하지 않으면 `Ok(None)`. 완전하면 소비한 바이트
    /// 수와 보낼 101 응답 바이트를 반환하고 세션은 done 상태가 됩니다.
    /// 같은 읽기에 업그레이드 이후 바이트가 붙어 있으면 그 바이트들은
    /// 첫 프레임으로 처리됩니다.
    pub fn try_handshake(&self, buf: &[u8]) -> Result<Option<(usize, Vec<u8>)>> {
        let header_end = match find_header_end(buf) {
            Some(n) => n,
            None => return Ok(None),
        };
        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| NetError::Protocol("업그레이드 요청이 UTF-8이 아님".into()))?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        if !request_line.starts_with("GET ") {
            return Err(NetError::Protocol(format!(
                "업그레이드 요청 라인이 아님: {}",
                request_line
            ))
            .into());
        }

        let mut headers: HashMap<String, String> = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let upgrade_ok = headers
            .get("upgrade")
            .map(|v| v.to_lowercase().contains("websocket"))
            .unwrap_or(false);
        if !upgrade_ok {
            return Err(NetError::Protocol("Upgrade: websocket 헤더 없음".into()).into());
        }
        let key = headers
            .get("sec-websocket-key")
            .ok_or_else(|| NetError::Protocol("Sec-WebSocket-Key 없음".into()))?;

        // 실제 원격 주소: X-Forwarded-For 첫 홉 > X-Real-IP
        let real = headers
            .get("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| headers.get("x-real-ip").cloned());
        *self.real_addr.write() = real;

        let response = self.build_response(key);
        self.handshake_done.store(true, Ordering::Release);
        Ok(Some((header_end + 4, response)))
    }

    fn build_response(&self, key: &str) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        hasher.update(WS_GUID.as_bytes());
        let accept = BASE64.encode(hasher.finalize());

        let mut resp = String::new();
        resp.push_str("HTTP/1.1 101 Switching Protocols\r\n");
        resp.push_str("Upgrade: websocket\r\n");
        resp.push_str("Connection: Upgrade\r\n");
        resp.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
        // 서버 핑거프린트: 결정적 식별자 집합
        resp.push_str(&format!(
            "X-Server-Fingerprint: netcore/{}\r\n",
            env!("CARGO_PKG_VERSION")
        ));
        resp.push_str(&format!("X-Server-Os: {}\r\n", std::env::consts::OS));
        resp.push_str(&format!("X-Server-Arch: {}\r\n", std::env::consts::ARCH));
        for (name, values) in &self.response_headers {
            for value in values {
                resp.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        resp.push_str("\r\n");
        resp.into_bytes()
    }

    /// 프레임 하나 파싱 시도.
    ///
    /// 완성된 프레임이 없으면 `Ok(None)`, 있으면 소비 바이트 수와
    /// 이벤트를 반환합니다.
    pub fn parse_frame(&self, buf: &[u8]) -> Result<Option<(usize, WsEvent)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(NetError::Protocol("예약 비트가 설정된 프레임".into()).into());
        }
        let op = buf[0] & 0x0F;
        let masked = buf[1] & 0x80 != 0;
        let len7 = (buf[1] & 0x7F) as usize;

        let mut offset = 2usize;
        let payload_len = match len7 {
            126 => {
                if buf.len() < offset + 2 {
                    return Ok(None);
                }
                let n = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
                offset += 2;
                n
            }
            127 => {
                if buf.len() < offset + 8 {
                    return Ok(None);
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[offset..offset + 8]);
                offset += 8;
                let n = u64::from_be_bytes(b);
                if n > MAX_FRAME_LEN as u64 {
                    return Err(NetError::Protocol(format!("프레임 길이 초과: {}", n)).into());
                }
                n as usize
            }
            n => n,
        };
        if payload_len > MAX_FRAME_LEN {
            return Err(NetError::Protocol(format!("프레임 길이 초과: {}", payload_len)).into());
        }

        // 클라이언트 -> 서버 프레임은 마스킹 필수
        if !masked {
            return Err(NetError::Protocol("마스킹되지 않은 클라이언트 프레임".into()).into());
        }
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mask: [u8; 4] = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;

        if buf.len() < offset + payload_len {
            return Ok(None);
        }
        let mut payload: Vec<u8> = buf[offset..offset + payload_len].to_vec();
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        let consumed = offset + payload_len;

        // 제어 프레임은 조각낼 수 없고 125바이트 이하
        if op >= opcode::CLOSE {
            if !fin || payload_len > 125 {
                return Err(NetError::Protocol("잘못된 제어 프레임".into()).into());
            }
            let event = match op {
                opcode::CLOSE => WsEvent::Close,
                opcode::PING => WsEvent::Ping(payload),
                opcode::PONG => WsEvent::Pong,
                other => {
                    return Err(
                        NetError::Protocol(format!("알 수 없는 opcode: {}", other)).into()
                    )
                }
            };
            return Ok(Some((consumed, event)));
        }

        let event = match op {
            opcode::TEXT | opcode::BINARY => {
                let text = op == opcode::TEXT;
                let mut frag = self.frag.lock();
                if frag.is_some() {
                    return Err(NetError::Protocol("조각 메시지 중 새 데이터 프레임".into()).into());
                }
                if fin {
                    WsEvent::Message { text, payload }
                } else {
                    *frag = Some((text, payload));
                    WsEvent::Partial
                }
            }
            opcode::CONTINUATION => {
                let mut frag = self.frag.lock();
                match frag.take() {
                    None => {
                        return Err(
                            NetError::Protocol("시작 프레임 없는 continuation".into()).into()
                        )
                    }
                    Some((text, mut acc)) => {
                        if acc.len() + payload.len() > MAX_FRAME_LEN {
                            return Err(NetError::Protocol("조각 메시지 길이 초과".into()).into());
                        }
                        acc.extend_from_slice(&payload);
                        if fin {
                            WsEvent::Message { text, payload: acc }
                        } else {
                            *frag = Some((text, acc));
                            WsEvent::Partial
                        }
                    }
                }
            }
            other => {
                return Err(NetError::Protocol(format!("알 수 없는 opcode: {}", other)).into())
            }
        };
        Ok(Some((consumed, event)))
    }
}

/// 서버 -> 클라이언트 프레임 인코딩 (마스킹 없음)
pub fn encode_frame(op: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | (op & 0x0F));
    if payload.len() < 126 {
        out.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

pub fn binary_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode::BINARY, payload)
}

pub fn text_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode::TEXT, payload)
}

pub fn pong_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode::PONG, payload)
}

pub fn close_frame() -> Vec<u8> {
    encode_frame(opcode::CLOSE, &[])
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// 테스트/클라이언트용: 마스킹된 클라이언트 프레임 인코딩
pub fn encode_client_frame(op: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | (op & 0x0F));
    if payload.len() < 126 {
        out.push(0x80 | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.push(0x80 | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}
