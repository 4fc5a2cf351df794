use chrono::{DateTime, Local, Utc};

/// 현재 시각 유틸리티
pub struct CurrentTime;

impl CurrentTime {
    /// "YYYY-MM-DD HH:MM:SS" 형식의 현재 로컬 시각
    pub fn now_string() -> String {
        let now: DateTime<Local> = Local::now();
        now.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Unix 타임스탬프 (초)
    pub fn now_ts() -> i64 {
        Utc::now().timestamp()
    }

    /// Unix 타임스탬프 (밀리초)
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}
