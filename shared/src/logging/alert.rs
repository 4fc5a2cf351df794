//! 에러 로그 샘플러
//!
//! 동일한 소스 위치에서 반복 발생하는 Error 레벨 로그를 억제합니다.
//! 설정된 접두사(`Panic`, `MsgDispatch`, `RecvMsg` 등)로 시작하는 메시지만
//! 샘플링 대상이며, 최초 1회는 즉시 내보내고 이후 발생 건수는 원자적으로
//! 집계하여 1분에 한 번 요약을 내보냅니다. 발생이 없는 1분이 지나면
//! 샘플링 항목은 제거됩니다.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::warn;

/// 기본 샘플링 접두사
const DEFAULT_PREFIXES: &[&str] = &["Panic", "MsgDispatch", "RecvMsg"];

/// 요약 주기
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

static GLOBAL: Lazy<AlertSampler> = Lazy::new(AlertSampler::new);

struct SampleEntry {
    /// 마지막 요약 이후 발생 건수
    count: AtomicU64,
    /// 최초 발생 메시지 (요약에 포함)
    first_message: String,
}

/// 소스 위치별 에러 로그 샘플러
pub struct AlertSampler {
    prefixes: RwLock<Vec<String>>,
    entries: DashMap<&'static str, Arc<SampleEntry>>,
    flusher_started: AtomicBool,
}

impl AlertSampler {
    fn new() -> Self {
        Self {
            prefixes: RwLock::new(
                DEFAULT_PREFIXES.iter().map(|s| s.to_string()).collect(),
            ),
            entries: DashMap::new(),
            flusher_started: AtomicBool::new(false),
        }
    }

    /// 프로세스 전역 샘플러
    pub fn global() -> &'static AlertSampler {
        &GLOBAL
    }

    /// 샘플링 접두사 교체
    pub fn set_prefixes(&self, prefixes: Vec<String>) {
        *self.prefixes.write() = prefixes;
    }

    /// 메시지가 샘플링 대상인지 확인
    pub fn matches(&self, message: &str) -> bool {
        self.prefixes
            .read()
            .iter()
            .any(|p| message.starts_with(p.as_str()))
    }

    /// 에러 발생 보고
    ///
    /// 반환값이 true면 호출자가 즉시 로그를 내보내야 합니다.
    /// 샘플링 대상이 아닌 메시지는 항상 true입니다.
    pub fn report(&self, position: &'static str, message: &str) -> bool {
        if !self.matches(message) {
            return true;
        }
        match self.entries.get(position) {
            Some(entry) => {
                entry.count.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.entries.insert(
                    position,
                    Arc::new(SampleEntry {
                        count: AtomicU64::new(0),
                        first_message: message.to_string(),
                    }),
                );
                true
            }
        }
    }

    /// 요약 1회 수행: 집계가 있으면 내보내고, 없으면 항목 제거
    pub fn flush_once(&self) {
        let mut evict: Vec<&'static str> = Vec::new();
        for item in self.entries.iter() {
            let count = item.value().count.swap(0, Ordering::Relaxed);
            if count > 0 {
                warn!(
                    "에러 로그 요약 [{}] {}회 발생: {}",
                    item.key(),
                    count,
                    item.value().first_message
                );
            } else {
                evict.push(item.key());
            }
        }
        for key in evict {
            self.entries.remove(key);
        }
    }

    /// 백그라운드 요약 스레드 시작 (중복 호출은 no-op)
    pub fn start(&'static self) {
        if self
            .flusher_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        std::thread::Builder::new()
            .name("alert-sampler".into())
            .spawn(move || loop {
                std::thread::sleep(FLUSH_INTERVAL);
                self.flush_once();
            })
            .ok();
    }

    #[cfg(test)]
    fn tracked(&self, position: &'static str) -> bool {
        self.entries.contains_key(position)
    }
}

/// 샘플링을 거치는 Error 로그
///
/// 설정된 접두사로 시작하는 메시지는 소스 위치별로 최초 1회만 즉시
/// 출력되고 이후에는 1분 요약으로 합쳐집니다.
#[macro_export]
macro_rules! alert_error {
    ($($arg:tt)*) => {{
        let position: &'static str = concat!(file!(), ":", line!());
        let message = format!($($arg)*);
        if $crate::logging::alert::AlertSampler::global().report(position, &message) {
            tracing::error!("{}", message);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_matching_message_always_emits() {
        let sampler = AlertSampler::new();
        assert!(sampler.report("a.rs:1", "일반 에러"));
        assert!(sampler.report("a.rs:1", "일반 에러"));
    }

    #[test]
    fn test_first_occurrence_emits_then_counts() {
        let sampler = AlertSampler::new();
        assert!(sampler.report("b.rs:10", "Panic in handler"));
        assert!(!sampler.report("b.rs:10", "Panic in handler"));
        assert!(!sampler.report("b.rs:10", "Panic in handler"));
        // 다른 위치는 독립적으로 샘플링
        assert!(sampler.report("b.rs:20", "Panic in tick"));
    }

    #[test]
    fn test_silent_minute_evicts_entry() {
        let sampler = AlertSampler::new();
        assert!(sampler.report("c.rs:5", "MsgDispatch failed"));
        assert!(!sampler.report("c.rs:5", "MsgDispatch failed"));

        // 집계가 있으므로 첫 flush에서는 유지
        sampler.flush_once();
        assert!(sampler.tracked("c.rs:5"));

        // 발생 없는 주기 이후에는 제거, 다음 발생은 다시 즉시 출력
        sampler.flush_once();
        assert!(!sampler.tracked("c.rs:5"));
        assert!(sampler.report("c.rs:5", "MsgDispatch failed"));
    }
}
