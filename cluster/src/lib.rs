//! 클러스터 디스커버리 라이브러리
//!
//! 피어 풀 / 서비스 디스커버리 패브릭입니다. 레지스트리 감시자가
//! 전달하는 `serviceName -> serviceId -> 레코드` 스냅샷을 diff하여
//! 아웃바운드 피어를 생성·교체·제거하고, 일관 해시 링으로 요청을
//! 라우팅합니다.
//!
//! # 데이터 흐름
//!
//! ```text
//! Watcher(Redis/수동) -> Backend.update_services (diff)
//!     -> Group (링/태그 서브 링) -> Peer (dial + 재연결)
//!     -> FramedConn -> Pipeline -> Dispatcher
//! ```
//!
//! # 모듈 구조
//!
//! - **registry**: 디스커버리 레코드와 Watcher/Register 계약
//! - **redis**: Redis 기반 레지스트리 플러그인
//! - **peer**: 아웃바운드 피어 연결
//! - **group**: serviceName 하나의 피어 집합과 라우팅 링
//! - **backend**: `serviceName -> Group` 레지스트리와 diff-and-apply
//! - **config**: 백엔드 설정

/// 레지스트리 계약과 플러그인
pub mod registry;

/// 아웃바운드 피어
pub mod peer;

/// 피어 그룹과 라우팅 링
pub mod group;

/// 백엔드 레지스트리
pub mod backend;

/// 백엔드 설정
pub mod config;

// 주요 타입 재수출
pub use backend::{Backend, BackendHooks, NoopBackendHooks};
pub use config::BackendTcpConfig;
pub use group::Group;
pub use peer::Peer;
pub use registry::redis::RedisRegistry;
pub use registry::{
    ManualWatcher, Register, ServiceConfig, WatchCallback, WatchFilter, Watcher,
};
