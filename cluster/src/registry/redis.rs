//! Redis 기반 서비스 레지스트리
//!
//! 서비스 레코드를 `registry:services:<name>` 해시에 id -> JSON으로
//! 보관하고, 인스턴스별 TTL 하트비트 키로 생존 여부를 판단합니다.
//! 감시자는 주기적으로 전체 스냅샷을 읽어 변경이 있을 때만 콜백을
//! 호출합니다 (변경 없는 폴링은 조용히 지나감).
//!
//! # 키 구조
//! - `registry:services:<name>`: HASH, field=id, value=ServiceConfig JSON
//! - `registry:hb:<name>:<id>`: TTL 하트비트 키

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::{Register, ServiceConfig, WatchCallback, WatchFilter, Watcher};

/// 하트비트 TTL
const HEARTBEAT_TTL_SECS: u64 = 10;

/// 하트비트 갱신 주기
const HEARTBEAT_REFRESH: Duration = Duration::from_secs(3);

/// 스냅샷 폴링 주기 (지터 별도)
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const KEY_PREFIX: &str = "registry";

fn services_key(name: &str) -> String {
    format!("{}:services:{}", KEY_PREFIX, name)
}

fn heartbeat_key(name: &str, id: &str) -> String {
    format!("{}:hb:{}:{}", KEY_PREFIX, name, id)
}

/// 감시할 이름 목록. 필터가 비어 있으면 키 스캔으로 전체를 찾습니다.
async fn resolve_names(conn: &ConnectionManager, filter: &WatchFilter) -> Result<Vec<String>> {
    if !filter.names.is_empty() {
        return Ok(filter
            .names
            .iter()
            .map(|n| n.trim().to_lowercase())
            .collect());
    }
    let mut conn = conn.clone();
    let pattern = format!("{}:services:*", KEY_PREFIX);
    let prefix_len = format!("{}:services:", KEY_PREFIX).len();
    let mut names = Vec::new();
    {
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            names.push(key[prefix_len..].to_string());
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// 이름 목록의 생존 레코드 전체를 읽습니다. 결과는 (name, id) 정렬.
async fn snapshot(conn: &ConnectionManager, names: &[String]) -> Result<Vec<ServiceConfig>> {
    let mut conn = conn.clone();
    let mut out: Vec<ServiceConfig> = Vec::new();
    for name in names {
        let records: HashMap<String, String> = conn.hgetall(services_key(name)).await?;
        for (id, json) in records {
            let conf: ServiceConfig = match serde_json::from_str(&json) {
                Ok(c) => c,
                Err(e) => {
                    warn!("레코드 파싱 실패: {}/{} ({})", name, id, e);
                    continue;
                }
            };
            let alive: bool = conn.exists(heartbeat_key(name, &id)).await?;
            if alive {
                out.push(conf);
            } else {
                debug!("하트비트 만료 레코드 제외: {}/{}", name, id);
            }
        }
    }
    out.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
    Ok(out)
}

/// Redis 레지스트리 (감시자 + 등록자)
pub struct RedisRegistry {
    conn: ConnectionManager,
    stop_tx: watch::Sender<bool>,
}

impl RedisRegistry {
    pub async fn new(url: &str) -> Result<Arc<Self>> {
        let client = redis::Client::open(url).context("Redis 클라이언트 생성 실패")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Redis 연결 실패")?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self { conn, stop_tx }))
    }

    /// 환경변수(redis_host, redis_port)로 접속. 값이 없으면 localhost:6379.
    pub async fn from_env() -> Result<Arc<Self>> {
        dotenv::dotenv().ok();
        let host = std::env::var("redis_host").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("redis_port").unwrap_or_else(|_| "6379".to_string());
        Self::new(&format!("redis://{}:{}", host, port)).await
    }

    /// 감시/하트비트 루프 정지
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// 하트비트 갱신 태스크 시작. 레지스트리 stop 시 함께 멈춥니다.
    pub fn spawn_heartbeat(self: &Arc<Self>, conf: ServiceConfig) {
        let conn = self.conn.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_REFRESH) => {
                        if let Err(e) = refresh_heartbeat(&conn, &conf).await {
                            warn!("하트비트 갱신 실패: {}/{} ({:#})", conf.name, conf.id, e);
                        }
                    }
                    res = stop_rx.changed() => {
                        if res.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn refresh_heartbeat(conn: &ConnectionManager, conf: &ServiceConfig) -> Result<()> {
    let mut conn = conn.clone();
    let _: () = conn
        .set_ex(heartbeat_key(&conf.name, &conf.id), 1, HEARTBEAT_TTL_SECS)
        .await?;
    Ok(())
}

#[async_trait]
impl Register for RedisRegistry {
    async fn register(&self, conf: &ServiceConfig) -> Result<()> {
        let mut normalized = conf.clone();
        normalized.normalize();
        let json = serde_json::to_string(&normalized)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(services_key(&normalized.name), &normalized.id, json)
            .await?;
        refresh_heartbeat(&self.conn, &normalized).await?;
        info!(
            "서비스 등록: {}/{} -> {}",
            normalized.name,
            normalized.id,
            normalized.endpoint()
        );
        Ok(())
    }

    async fn deregister(&self, conf: &ServiceConfig) -> Result<()> {
        let mut normalized = conf.clone();
        normalized.normalize();
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(services_key(&normalized.name), &normalized.id)
            .await?;
        let _: () = conn
            .del(heartbeat_key(&normalized.name, &normalized.id))
            .await?;
        info!("서비스 해제: {}/{}", normalized.name, normalized.id);
        Ok(())
    }
}

#[async_trait]
impl Watcher for RedisRegistry {
    /// 폴링 감시 시작. 스냅샷이 이전과 다를 때만 콜백을 호출합니다.
    async fn watch_services(&self, filter: WatchFilter, callback: WatchCallback) -> Result<()> {
        // 연결/권한 문제를 구독 시점에 드러내기 위해 첫 스냅샷은 동기로 읽는다
        let names = resolve_names(&self.conn, &filter).await?;
        let first = snapshot(&self.conn, &names).await?;
        callback(first.clone());

        let conn = self.conn.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut last = first;
        tokio::spawn(async move {
            loop {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL + jitter) => {}
                    res = stop_rx.changed() => {
                        if res.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let names = match resolve_names(&conn, &filter).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("레지스트리 이름 조회 실패: {:#}", e);
                        continue;
                    }
                };
                match snapshot(&conn, &names).await {
                    Ok(current) => {
                        if current != last {
                            debug!("레지스트리 변경 감지: {}개 레코드", current.len());
                            last = current.clone();
                            callback(current);
                        }
                    }
                    Err(e) => {
                        // 일시적 장애: 이전 스냅샷을 유지하고 다음 주기에 재시도
                        warn!("레지스트리 스냅샷 실패: {:#}", e);
                    }
                }
            }
        });
        Ok(())
    }
}
