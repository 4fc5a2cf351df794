//! 서비스 레지스트리 계약
//!
//! 디스커버리 레코드와 감시자(Watcher)/등록자(Register) 인터페이스를
//! 정의합니다. Consul/Nacos/Redis 어느 쪽이든 "변경 시마다 전체
//! 스냅샷을 전달"하는 감시자만 구현하면 백엔드에 연결할 수 있습니다.
//! 스냅샷 diff는 백엔드의 책임입니다.

pub mod redis;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 디스커버리 레코드
///
/// 감시자가 발행한 이후에는 불변으로 취급합니다. 변경 감지 동등성은
/// `(name, id, address, port, metadata)` 필드 단위이며, 태그 변경은
/// 링 멤버십에만 영향을 줍니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 서비스 이름 (trim + 소문자로 정규화)
    pub name: String,
    /// 인스턴스 id (trim + 소문자로 정규화)
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// 라우팅 태그 (소문자, 중복 제거, 정렬)
    #[serde(default)]
    pub routing_tags: Vec<String>,
}

impl ServiceConfig {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        let mut conf = Self {
            name: name.into(),
            id: id.into(),
            address: address.into(),
            port,
            metadata: BTreeMap::new(),
            routing_tags: Vec::new(),
        };
        conf.normalize();
        conf
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.routing_tags = tags;
        self.normalize();
        self
    }

    /// 식별자/태그 정규화: trim + 소문자, 태그는 중복 제거 후 정렬
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_lowercase();
        self.id = self.id.trim().to_lowercase();
        self.address = self.address.trim().to_string();
        let mut tags: Vec<String> = self
            .routing_tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort();
        tags.dedup();
        self.routing_tags = tags;
    }

    /// 접속 주소 "host:port"
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }

    /// 변경 감지 동등성 (태그 제외)
    pub fn same_record(&self, other: &Self) -> bool {
        self.name == other.name
            && self.id == other.id
            && self.address == other.address
            && self.port == other.port
            && self.metadata == other.metadata
    }
}

/// 감시 대상 필터
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    /// 감시할 서비스 이름 목록. 비어 있으면 전체.
    pub names: Vec<String>,
}

/// 스냅샷 콜백. 변경 시마다 원하는 상태의 전체 목록이 전달됩니다.
pub type WatchCallback = Arc<dyn Fn(Vec<ServiceConfig>) + Send + Sync>;

/// 레지스트리 감시자 계약
#[async_trait]
pub trait Watcher: Send + Sync {
    /// 구독 시작. 이후 변경 시마다 콜백이 전체 스냅샷을 받습니다.
    async fn watch_services(&self, filter: WatchFilter, callback: WatchCallback) -> Result<()>;
}

/// 레지스트리 등록자 계약
#[async_trait]
pub trait Register: Send + Sync {
    async fn register(&self, conf: &ServiceConfig) -> Result<()>;
    async fn deregister(&self, conf: &ServiceConfig) -> Result<()>;
}

/// 수동 발행 감시자
///
/// 테스트와 정적 구성에서 사용합니다. `publish`로 스냅샷을 밀어 넣으면
/// 구독 중인 콜백이 동기적으로 호출됩니다.
#[derive(Default)]
pub struct ManualWatcher {
    callback: Mutex<Option<WatchCallback>>,
    last: Mutex<Option<Vec<ServiceConfig>>>,
}

impl ManualWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 스냅샷 발행. 구독자가 없으면 보관했다가 구독 시 전달합니다.
    pub fn publish(&self, confs: Vec<ServiceConfig>) {
        let callback = self.callback.lock().clone();
        match callback {
            Some(cb) => cb(confs),
            None => *self.last.lock() = Some(confs),
        }
    }
}

#[async_trait]
impl Watcher for ManualWatcher {
    async fn watch_services(&self, _filter: WatchFilter, callback: WatchCallback) -> Result<()> {
        *self.callback.lock() = Some(callback.clone());
        if let Some(pending) = self.last.lock().take() {
            callback(pending);
        }
        Ok(())
    }
}
