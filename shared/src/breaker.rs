//! 서킷 브레이커
//!
//! 메시지 핸들러와 외부 호출을 감싸는 이름 기반 차단 게이트입니다.
//! `msg_<id>`, `gin_<path>`, `http_<url>` 형태의 이름으로 설정을 조회하며,
//! 10초 롤링 윈도우의 에러 비율이 임계치를 넘으면 열림(open) 상태로
//! 전환되어 sleep window 동안 호출을 차단합니다.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::tool::{CurrentTime, NetError};

/// 롤링 윈도우 길이 (초)
const WINDOW_SECS: i64 = 10;

fn default_timeout_ms() -> u64 {
    1000
}
fn default_max_concurrent() -> u32 {
    100
}
fn default_volume_threshold() -> u64 {
    20
}
fn default_sleep_window_ms() -> u64 {
    5000
}
fn default_error_percent() -> u32 {
    50
}

/// 브레이커 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// 개별 호출 타임아웃 (밀리초)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 동시 실행 상한
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// 윈도우 내 최소 호출 수 (이보다 적으면 차단 판단을 하지 않음)
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u64,
    /// 열림 상태 유지 시간 (밀리초)
    #[serde(default = "default_sleep_window_ms")]
    pub sleep_window_ms: u64,
    /// 차단 기준 에러 비율 (%)
    #[serde(default = "default_error_percent")]
    pub error_percent: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            volume_threshold: default_volume_threshold(),
            sleep_window_ms: default_sleep_window_ms(),
            error_percent: default_error_percent(),
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    sec: i64,
    total: u64,
    failed: u64,
}

/// 단일 이름에 대한 브레이커 인스턴스
pub struct Breaker {
    name: String,
    cfg: BreakerConfig,
    inflight: AtomicU32,
    /// 열림 시각 (epoch millis), 0 = 닫힘
    opened_at_ms: AtomicI64,
    /// half-open 상태에서 단일 probe 실행 여부
    probing: AtomicU32,
    window: Mutex<VecDeque<Bucket>>,
}

impl Breaker {
    fn new(name: String, cfg: BreakerConfig) -> Self {
        Self {
            name,
            cfg,
            inflight: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            probing: AtomicU32::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.opened_at_ms.load(Ordering::Acquire) != 0
    }

    /// 게이트를 통과시켜 future를 실행합니다.
    ///
    /// 열림 상태에서는 sleep window가 지난 뒤 단 하나의 probe 호출만
    /// 통과시키고, probe 성공 시 닫힘으로 복귀합니다.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut is_probe = false;
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if opened_at != 0 {
            let now = CurrentTime::now_millis();
            if now < opened_at + self.cfg.sleep_window_ms as i64 {
                return Err(NetError::BreakerOpen(self.name.clone()).into());
            }
            // sleep window 경과: probe 슬롯 선점 시도
            if self
                .probing
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(NetError::BreakerOpen(self.name.clone()).into());
            }
            is_probe = true;
        }

        if !is_probe {
            let cur = self.inflight.fetch_add(1, Ordering::AcqRel);
            if cur >= self.cfg.max_concurrent {
                self.inflight.fetch_sub(1, Ordering::AcqRel);
                self.record(false);
                return Err(NetError::BreakerConcurrency(self.name.clone()).into());
            }
        }

        let timeout = std::time::Duration::from_millis(self.cfg.timeout_ms);
        let outcome = tokio::time::timeout(timeout, fut).await;

        if !is_probe {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
        }

        let result = match outcome {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetError::BreakerTimeout(self.name.clone()).into()),
        };

        if is_probe {
            self.probing.store(0, Ordering::Release);
            match &result {
                Ok(_) => self.close(),
                Err(_) => {
                    // probe 실패: sleep window 재시작
                    self.opened_at_ms
                        .store(CurrentTime::now_millis(), Ordering::Release);
                }
            }
            return result;
        }

        self.record(result.is_ok());
        self.evaluate();
        result
    }

    fn close(&self) {
        self.opened_at_ms.store(0, Ordering::Release);
        self.window.lock().clear();
        info!("서킷 브레이커 닫힘: {}", self.name);
    }

    fn record(&self, ok: bool) {
        let sec = CurrentTime::now_ts();
        let mut window = self.window.lock();
        while window
            .front()
            .map(|b| b.sec <= sec - WINDOW_SECS)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        if window.back().map(|b| b.sec != sec).unwrap_or(true) {
            window.push_back(Bucket {
                sec,
                total: 0,
                failed: 0,
            });
        }
        if let Some(bucket) = window.back_mut() {
            bucket.total += 1;
            if !ok {
                bucket.failed += 1;
            }
        }
    }

    fn evaluate(&self) {
        if self.is_open() {
            return;
        }
        let (total, failed) = {
            let window = self.window.lock();
            window
                .iter()
                .fold((0u64, 0u64), |(t, f), b| (t + b.total, f + b.failed))
        };
        if total < self.cfg.volume_threshold {
            return;
        }
        if failed * 100 >= total * self.cfg.error_percent as u64 {
            self.opened_at_ms
                .store(CurrentTime::now_millis(), Ordering::Release);
            warn!(
                "서킷 브레이커 열림: {} (실패 {}/{}, 기준 {}%)",
                self.name, failed, total, self.cfg.error_percent
            );
        }
    }
}

/// 이름 -> 브레이커 테이블
///
/// 설정 맵에 대한 조회는 정확히 일치하는 이름을 우선하고,
/// 없으면 가장 긴 접두사(prefix) 항목을 사용합니다.
#[derive(Default)]
pub struct BreakerTable {
    configs: RwLock<HashMap<String, BreakerConfig>>,
    breakers: DashMap<String, Arc<Breaker>>,
}

impl BreakerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 교체 (설정 리로드 시 호출)
    ///
    /// 설정이 바뀐 이름의 브레이커 인스턴스는 버리고 다음 호출 때 재생성합니다.
    pub fn set_configs(&self, configs: HashMap<String, BreakerConfig>) {
        {
            let mut cur = self.configs.write();
            *cur = configs;
        }
        let cur = self.configs.read();
        self.breakers.retain(|name, breaker| {
            Self::match_config(&*cur, name)
                .map(|cfg| *cfg == breaker.cfg)
                .unwrap_or(false)
        });
    }

    fn match_config<'a>(
        configs: &'a HashMap<String, BreakerConfig>,
        name: &str,
    ) -> Option<&'a BreakerConfig> {
        if let Some(cfg) = configs.get(name) {
            return Some(cfg);
        }
        configs
            .iter()
            .filter(|(k, _)| name.starts_with(k.as_str()))
            .max_by_key(|(k, _)| k.len())
            .map(|(_, v)| v)
    }

    /// 이름에 설정이 걸려 있으면 브레이커를 반환합니다.
    pub fn lookup(&self, name: &str) -> Option<Arc<Breaker>> {
        if let Some(b) = self.breakers.get(name) {
            return Some(b.clone());
        }
        let cfg = {
            let configs = self.configs.read();
            Self::match_config(&*configs, name).cloned()
        }?;
        let breaker = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(name.to_string(), cfg)))
            .clone();
        Some(breaker)
    }

    /// 이름에 브레이커가 설정되어 있으면 게이트 아래에서, 아니면 그대로 실행
    pub async fn run_under<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.lookup(name) {
            Some(breaker) => breaker.run(fut).await,
            None => fut.await,
        }
    }
}
