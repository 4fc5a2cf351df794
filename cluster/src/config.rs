//! 백엔드 설정

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_tick_interval() -> f64 {
    1.0
}

/// 아웃바운드 피어 풀 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTcpConfig {
    /// 피어 연결의 순차 실행기 사용 여부
    #[serde(default = "default_true")]
    pub msg_seq: bool,

    /// true면 사라진 피어를 업데이트 시점에 즉시 닫고 제거,
    /// false면 연결이 끊어질 때까지 유지 (우아한 제거)
    #[serde(default)]
    pub immediately: bool,

    /// 감시자 폴링 등 유지보수 주기의 기본값 (초)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_sec: f64,
}

impl Default for BackendTcpConfig {
    fn default() -> Self {
        Self {
            msg_seq: true,
            immediately: false,
            tick_interval_sec: default_tick_interval(),
        }
    }
}
