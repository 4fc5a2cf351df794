//! 로깅 시스템
//!
//! tracing 기반 로깅 초기화와 에러 로그 샘플링을 제공합니다.
//!
//! # 주요 기능
//! - **환경변수 필터**: `RUST_LOG`로 레벨 제어 (기본 info)
//! - **에러 로그 샘플링**: 동일 위치 반복 에러를 1분 요약으로 억제
//!
//! # 사용 예시
//! ```rust,no_run
//! shared::logging::init_logging("tcpserver").unwrap();
//! ```

pub mod alert;

pub use alert::AlertSampler;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 로깅 시스템 초기화
///
/// 프로세스당 한 번 호출합니다. 이미 초기화된 경우 에러를 반환하므로
/// 테스트에서는 결과를 무시해도 됩니다.
pub fn init_logging(service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("로깅 초기화 실패: {}", e))?;

    AlertSampler::global().start();
    info!("로깅 시스템 초기화 완료: {}", service_name);
    Ok(())
}
