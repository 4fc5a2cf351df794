//! 네트워크 코어 설정
//!
//! C12 설정 로더(shared::config)로 로드되는 서버/디스패치 설정입니다.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use shared::BreakerConfig;

fn default_true() -> bool {
    true
}

fn default_tick_interval() -> f64 {
    1.0
}

/// 인바운드 TCP 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTcpConfig {
    /// 유휴 연결 정리 임계값 (초). 0이면 비활성.
    #[serde(default)]
    pub active_timeout_sec: i64,

    /// 연결별 순차 실행기 사용 여부
    #[serde(default = "default_true")]
    pub msg_seq: bool,

    /// 틱 스케줄러 간격 (초)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_sec: f64,

    /// 수락된 연결에 WebSocket 업그레이드 레이어 적용 여부
    #[serde(default)]
    pub websocket: bool,

    /// 업그레이드 응답에 추가할 헤더. 하나의 이름이 여러 값을 가질 수 있음.
    #[serde(default)]
    pub ws_response_headers: HashMap<String, Vec<String>>,

    /// WS 텍스트 프레임을 감쌀 봉투의 메시지 id
    #[serde(default)]
    pub ws_text_msg_id: u32,

    /// 리슨 소켓에 SO_REUSEADDR 설정 여부
    #[serde(default = "default_true")]
    pub reuse_addr: bool,
}

impl Default for ServerTcpConfig {
    fn default() -> Self {
        Self {
            active_timeout_sec: 0,
            msg_seq: true,
            tick_interval_sec: default_tick_interval(),
            websocket: false,
            ws_response_headers: HashMap::new(),
            ws_text_msg_id: 0,
            reuse_addr: true,
        }
    }
}

/// 메시지 디스패치 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// 디스패치 로그를 남기지 않을 메시지 id 목록
    #[serde(default)]
    pub ignore_msg_ids: Vec<String>,

    /// 핸들러 지연 경고 임계값 (초). 0이면 관찰 비활성.
    #[serde(default)]
    pub timeout_check_sec: i64,

    /// 메시지 id -> 서킷 브레이커 설정
    #[serde(default)]
    pub hystrix: HashMap<String, BreakerConfig>,
}
