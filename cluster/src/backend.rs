//! 백엔드 레지스트리
//!
//! `serviceName -> Group` 2단계 레지스트리입니다. 감시자가 전달한
//! 전체 스냅샷을 원하는 상태로 보고 diff-and-apply 트랜잭션을
//! 수행합니다. 사라진 피어는 설정에 따라 즉시(immediately) 또는
//! 우아하게(연결이 끊어질 때까지 유지) 제거합니다.
//!
//! 훅(on_add/on_remove/on_connected/on_disconnect)은 레지스트리 락
//! 밖에서 호출되며, 훅 안의 패닉은 복구되어 로그로 남습니다.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use netcore::conn::{ConnEvents, FramedConn};
use netcore::dispatch::Dispatcher;
use netcore::message::{Envelope, EnvelopeCodec, RpcRespCheck, Sender};
use netcore::pipeline::Pipeline;
use shared::{alert_error, NetError};

use crate::config::BackendTcpConfig;
use crate::group::Group;
use crate::peer::Peer;
use crate::registry::{ServiceConfig, WatchCallback, WatchFilter, Watcher};

/// 백엔드 수준 훅
#[async_trait]
pub trait BackendHooks: Send + Sync + 'static {
    /// 새 레코드로 피어가 생성됨 (접속 성공과는 별개)
    async fn on_add(&self, conf: &ServiceConfig) {
        let _ = conf;
    }

    /// 피어가 레지스트리에서 제거됨
    async fn on_remove(&self, conf: &ServiceConfig) {
        let _ = conf;
    }

    async fn on_connected(&self, peer: &Arc<Peer>) {
        let _ = peer;
    }

    async fn on_disconnect(&self, peer: &Arc<Peer>, err: Option<NetError>) {
        let _ = (peer, err);
    }
}

/// 기본 no-op 훅
pub struct NoopBackendHooks;

#[async_trait]
impl BackendHooks for NoopBackendHooks {}

enum HookEvent {
    Add(ServiceConfig),
    Remove(ServiceConfig),
}

/// 아웃바운드 피어 풀 레지스트리
pub struct Backend {
    cfg: BackendTcpConfig,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    dispatcher: Arc<Dispatcher>,
    codec: Arc<dyn EnvelopeCodec>,
    hooks: Arc<dyn BackendHooks>,
    check_rpc_resp: RwLock<Option<RpcRespCheck>>,
}

impl Backend {
    pub fn new(
        cfg: BackendTcpConfig,
        dispatcher: Arc<Dispatcher>,
        codec: Arc<dyn EnvelopeCodec>,
        hooks: Arc<dyn BackendHooks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            groups: RwLock::new(HashMap::new()),
            dispatcher,
            codec,
            hooks,
            check_rpc_resp: RwLock::new(None),
        })
    }

    /// RPC 응답 판별 훅. 이후 생성되는 피어에 적용됩니다.
    pub fn set_rpc_check(&self, check: RpcRespCheck) {
        *self.check_rpc_resp.write() = Some(check);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 감시자 구독: 스냅샷이 올 때마다 update_services를 수행합니다.
    pub async fn watch(self: &Arc<Self>, watcher: Arc<dyn Watcher>, filter: WatchFilter) -> Result<()> {
        let backend = Arc::downgrade(self);
        let callback: WatchCallback = Arc::new(move |confs| {
            if let Some(backend) = backend.upgrade() {
                backend.update_services(confs);
            }
        });
        watcher.watch_services(filter, callback).await
    }

    /// 감시자의 diff-and-apply 트랜잭션
    ///
    /// 전달된 목록을 원하는 상태 전체로 보고, 그룹/피어를 생성·교체·
    /// 제거합니다. 같은 목록을 연속 두 번 적용하면 두 번째는 아무
    /// 이벤트도 만들지 않습니다 (멱등).
    pub fn update_services(self: &Arc<Self>, confs: Vec<ServiceConfig>) {
        let mut desired: HashMap<String, HashMap<String, ServiceConfig>> = HashMap::new();
        for mut conf in confs {
            conf.normalize();
            if conf.name.is_empty() || conf.id.is_empty() {
                warn!("이름 또는 id가 빈 레코드 무시: {:?}", conf);
                continue;
            }
            desired
                .entry(conf.name.clone())
                .or_default()
                .insert(conf.id.clone(), conf);
        }
        // 사라진 이름도 빈 항목으로 포함시켜 아래 루프가 제거하게 한다
        for name in self.group_names() {
            desired.entry(name).or_default();
        }

        let mut events: Vec<HookEvent> = Vec::new();
        for (name, desired_for_name) in desired {
            self.apply_group(&name, desired_for_name, &mut events);
        }
        self.fire_events(events);
    }

    fn apply_group(
        self: &Arc<Self>,
        name: &str,
        desired: HashMap<String, ServiceConfig>,
        events: &mut Vec<HookEvent>,
    ) {
        let group = {
            let mut groups = self.groups.write();
            match groups.get(name) {
                Some(group) => group.clone(),
                None => {
                    if desired.is_empty() {
                        return;
                    }
                    let group = Group::new(name);
                    groups.insert(name.to_string(), group.clone());
                    info!("그룹 생성: {}", name);
                    group
                }
            }
        };

        // 제거: 그룹에 있으나 desired에 없는 피어
        for id in group.peer_ids() {
            if desired.contains_key(&id) {
                continue;
            }
            if let Some(peer) = group.get(&id) {
                self.retire_peer(&group, &peer, events);
            }
        }

        // 생성/교체/복원
        for (id, conf) in desired {
            match group.get(&id) {
                Some(peer) => {
                    let old = peer.conf();
                    if !old.same_endpoint(&conf) {
                        // endpoint가 바뀌면 교체: 기존 피어 즉시 제거 후 재생성
                        debug!(
                            "피어 교체: {}/{} {} -> {}",
                            name,
                            id,
                            old.endpoint(),
                            conf.endpoint()
                        );
                        self.remove_peer_now(&group, &peer, events);
                        self.spawn_peer(&group, conf, events);
                    } else {
                        let was_destroyed = peer.is_destroyed();
                        let tags_changed = old.routing_tags != conf.routing_tags;
                        peer.set_conf(conf);
                        if was_destroyed {
                            // 같은 endpoint가 되살아남: 파기 취소 후 재합류
                            peer.clear_destroyed();
                            if peer.is_connected() {
                                peer.join_rings();
                            }
                        } else if tags_changed {
                            group.sync_tags(&id, &old.routing_tags, &peer.conf().routing_tags);
                        }
                    }
                }
                None => self.spawn_peer(&group, conf, events),
            }
        }

        // 비게 된 그룹은 같은 트랜잭션 안에서 삭제
        if group.is_empty() {
            self.groups.write().remove(name);
            info!("그룹 삭제: {}", name);
        }
    }

    /// 사라진 피어 처리. 링 이탈은 파기 표시 시점에 즉시 수행합니다
    /// (죽어 가는 config로는 더 이상 라우팅하지 않음).
    fn retire_peer(&self, group: &Arc<Group>, peer: &Arc<Peer>, events: &mut Vec<HookEvent>) {
        peer.leave_rings();
        peer.mark_destroyed();
        if self.cfg.immediately {
            self.remove_peer_now(group, peer, events);
        }
        // graceful: 피어는 연결이 끊어질 때 PeerEvents가 제거
    }

    fn remove_peer_now(&self, group: &Arc<Group>, peer: &Arc<Peer>, events: &mut Vec<HookEvent>) {
        peer.leave_rings();
        peer.mark_destroyed();
        peer.shutdown();
        if group.remove(peer) && peer.claim_removal() {
            events.push(HookEvent::Remove(peer.conf()));
        }
    }

    fn spawn_peer(self: &Arc<Self>, group: &Arc<Group>, conf: ServiceConfig, events: &mut Vec<HookEvent>) {
        let conn = FramedConn::dial(
            format!("peer-{}-{}", conf.name, conf.id),
            conf.endpoint(),
        );
        let mut pipeline = Pipeline::new(self.codec.clone(), self.dispatcher.clone())
            .with_msg_seq(self.cfg.msg_seq);
        if let Some(check) = self.check_rpc_resp.read().clone() {
            pipeline = pipeline.with_rpc_check(check);
        }
        let peer = Peer::new(conf.clone(), conn.clone(), pipeline, Arc::downgrade(group));
        group.insert(peer.clone());

        let sink = Arc::new(PeerEvents {
            peer,
            backend: Arc::downgrade(self),
        });
        conn.start(sink);
        debug!("피어 생성: {}/{} -> {}", conf.name, conf.id, conf.endpoint());
        events.push(HookEvent::Add(conf));
    }

    /// 파기된 피어의 최종 제거 (피어 이벤트 경로에서 호출)
    pub(crate) fn finish_remove(&self, peer: &Arc<Peer>) {
        if let Some(group) = peer.group() {
            group.remove(peer);
            if group.is_empty() {
                let mut groups = self.groups.write();
                let still_same = groups
                    .get(group.name())
                    .map(|g| Arc::ptr_eq(g, &group))
                    .unwrap_or(false);
                if still_same && group.is_empty() {
                    groups.remove(group.name());
                    info!("그룹 삭제: {}", group.name());
                }
            }
        }
        if peer.claim_removal() {
            let hooks = self.hooks.clone();
            let conf = peer.conf();
            tokio::spawn(async move {
                call_hook(hooks.on_remove(&conf)).await;
            });
        }
    }

    fn fire_events(&self, events: Vec<HookEvent>) {
        if events.is_empty() {
            return;
        }
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            for event in events {
                match event {
                    HookEvent::Add(conf) => call_hook(hooks.on_add(&conf)).await,
                    HookEvent::Remove(conf) => call_hook(hooks.on_remove(&conf)).await,
                }
            }
        });
    }

    // ---- 라우팅 API ----

    pub fn group(&self, name: &str) -> Option<Arc<Group>> {
        let name = name.trim().to_lowercase();
        self.groups.read().get(&name).cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// (name, id)로 피어 조회
    pub fn get_service(&self, name: &str, id: &str) -> Option<Arc<Peer>> {
        self.group(name)?.get(&id.trim().to_lowercase())
    }

    /// 요청 키 해싱으로 피어 선택
    pub fn get_service_by_hash(&self, name: &str, key: &str) -> Option<Arc<Peer>> {
        self.group(name)?.get_by_hash(key)
    }

    /// 태그 서브 링에서 해싱으로 피어 선택
    pub fn get_service_by_tag_and_hash(
        &self,
        name: &str,
        tag: &str,
        key: &str,
    ) -> Option<Arc<Peer>> {
        self.group(name)?.get_by_tag_and_hash(tag, key)
    }

    // ---- 브로드캐스트 (best-effort: 실패는 로그만 남김) ----

    /// 모든 그룹의 모든 피어에게 전송
    pub async fn broadcast(&self, env: &dyn Envelope) {
        let groups: Vec<Arc<Group>> = self.groups.read().values().cloned().collect();
        for group in groups {
            self.broadcast_peers(group.peers(), env).await;
        }
    }

    /// 한 그룹의 모든 피어에게 전송
    pub async fn broadcast_group(&self, name: &str, env: &dyn Envelope) {
        if let Some(group) = self.group(name) {
            self.broadcast_peers(group.peers(), env).await;
        }
    }

    /// 그룹마다 해시로 고른 피어 하나에게 전송
    pub async fn broadcast_one_per_group(&self, key: &str, env: &dyn Envelope) {
        let groups: Vec<Arc<Group>> = self.groups.read().values().cloned().collect();
        let mut targets = Vec::new();
        for group in groups {
            if let Some(peer) = group.get_by_hash(key) {
                targets.push(peer);
            }
        }
        self.broadcast_peers(targets, env).await;
    }

    async fn broadcast_peers(&self, peers: Vec<Arc<Peer>>, env: &dyn Envelope) {
        let bytes = match env.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("브로드캐스트 인코딩 실패: {:#}", e);
                return;
            }
        };
        for peer in peers {
            if !peer.is_connected() {
                continue;
            }
            if let Err(e) = peer.send(bytes.clone()).await {
                warn!("브로드캐스트 전송 실패: {} ({:#})", peer.conn_name(), e);
            }
        }
    }

    /// 모든 피어를 닫고 레지스트리를 비웁니다.
    pub async fn stop(&self) {
        let groups: Vec<Arc<Group>> = {
            let mut map = self.groups.write();
            let groups = map.values().cloned().collect();
            map.clear();
            groups
        };
        for group in groups {
            for peer in group.peers() {
                peer.mark_destroyed();
                peer.close(false).await;
            }
        }
        info!("백엔드 종료");
    }
}

/// FramedConn 이벤트를 피어/백엔드에 연결하는 어댑터
struct PeerEvents {
    peer: Arc<Peer>,
    backend: Weak<Backend>,
}

#[async_trait]
impl ConnEvents for PeerEvents {
    async fn on_dial_success(&self) {
        if self.peer.is_destroyed() {
            // 파기된 피어는 합류하지 않고 바로 종료 경로로
            self.peer.shutdown();
            return;
        }
        self.peer.join_rings();
        if let Some(backend) = self.backend.upgrade() {
            call_hook(backend.hooks.on_connected(&self.peer)).await;
        }
    }

    async fn on_dial_fail(&self, err: NetError) -> Option<NetError> {
        if self.peer.is_destroyed() {
            if let Some(backend) = self.backend.upgrade() {
                backend.finish_remove(&self.peer);
            }
            return Some(err);
        }
        None
    }

    async fn on_disconnect(&self, err: Option<NetError>) -> Option<NetError> {
        self.peer.leave_rings();
        self.peer.rpc().purge();
        let backend = match self.backend.upgrade() {
            Some(b) => b,
            None => return Some(NetError::Stopped),
        };
        call_hook(backend.hooks.on_disconnect(&self.peer, err.clone())).await;
        if self.peer.is_destroyed() {
            backend.finish_remove(&self.peer);
            return Some(err.unwrap_or(NetError::Stopped));
        }
        None
    }

    async fn on_recv(&self, buf: &[u8]) -> Result<usize> {
        self.peer.consume_recv(buf)
    }
}

/// 훅 패닉 격리 래퍼
async fn call_hook(fut: impl std::future::Future<Output = ()>) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        alert_error!("Panic in backend hook: {}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore::codec::BinCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHooks {
        adds: AtomicUsize,
        removes: AtomicUsize,
    }

    impl CountingHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                adds: AtomicUsize::new(0),
                removes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BackendHooks for CountingHooks {
        async fn on_add(&self, _conf: &ServiceConfig) {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_remove(&self, _conf: &ServiceConfig) {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn backend_with(immediately: bool, hooks: Arc<CountingHooks>) -> Arc<Backend> {
        let cfg = BackendTcpConfig {
            immediately,
            ..Default::default()
        };
        Backend::new(
            cfg,
            Arc::new(Dispatcher::default()),
            Arc::new(BinCodec),
            hooks,
        )
    }

    fn confs_two() -> Vec<ServiceConfig> {
        vec![
            // 닫힌 포트: 다이얼은 계속 실패하지만 피어 객체는 유지된다
            ServiceConfig::new("game", "a", "127.0.0.1", 1),
            ServiceConfig::new("game", "b", "127.0.0.1", 2),
        ]
    }

    #[tokio::test]
    async fn test_update_creates_groups_and_peers() {
        let hooks = CountingHooks::new();
        let backend = backend_with(false, hooks.clone());

        backend.update_services(confs_two());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(backend.group_count(), 1);
        let group = backend.group("game").unwrap();
        assert_eq!(group.len(), 2);
        assert!(backend.get_service("game", "a").is_some());
        assert!(backend.get_service("GAME", " A ").is_some(), "조회도 정규화되어야 함");
        assert_eq!(hooks.adds.load(Ordering::SeqCst), 2);
        // 접속 전이므로 링은 비어 있어야 함
        assert!(group.ring_ids().is_empty());

        backend.stop().await;
    }

    /// 같은 스냅샷을 두 번 적용하면 두 번째는 이벤트가 없어야 함 (멱등)
    #[tokio::test]
    async fn test_diff_idempotence() {
        let hooks = CountingHooks::new();
        let backend = backend_with(true, hooks.clone());

        backend.update_services(confs_two());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let adds = hooks.adds.load(Ordering::SeqCst);

        backend.update_services(confs_two());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hooks.adds.load(Ordering::SeqCst), adds);
        assert_eq!(hooks.removes.load(Ordering::SeqCst), 0);

        backend.stop().await;
    }

    /// 빈 목록 적용은 모든 그룹을 제거해야 함 (immediate 모드)
    #[tokio::test]
    async fn test_empty_update_eliminates_groups_immediately() {
        let hooks = CountingHooks::new();
        let backend = backend_with(true, hooks.clone());

        backend.update_services(confs_two());
        assert_eq!(backend.group_count(), 1);

        backend.update_services(Vec::new());
        assert_eq!(backend.group_count(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.removes.load(Ordering::SeqCst), 2);

        // 이전 상태를 다시 적용하면 동등한 상태가 복원되어야 함
        backend.update_services(confs_two());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.group_count(), 1);
        let mut ids = backend.group("game").unwrap().peer_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        backend.stop().await;
    }

    /// graceful 모드: 사라진 피어는 파기 표시만 되고, 다이얼 루프가
    /// 정리할 때까지 잠시 유지된다
    #[tokio::test]
    async fn test_graceful_retire_marks_destroyed() {
        let hooks = CountingHooks::new();
        let backend = backend_with(false, hooks.clone());

        backend.update_services(confs_two());
        let peer_a = backend.get_service("game", "a").unwrap();

        backend.update_services(vec![ServiceConfig::new("game", "b", "127.0.0.1", 2)]);
        assert!(peer_a.is_destroyed());

        // 닫힌 포트로의 다이얼이 실패하면서 파기된 피어가 정리된다
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(backend.get_service("game", "a").is_none());
        assert_eq!(hooks.removes.load(Ordering::SeqCst), 1);

        backend.stop().await;
    }

    /// endpoint가 바뀐 레코드는 교체로 처리된다
    #[tokio::test]
    async fn test_endpoint_change_replaces_peer() {
        let hooks = CountingHooks::new();
        let backend = backend_with(true, hooks.clone());

        backend.update_services(vec![ServiceConfig::new("game", "a", "127.0.0.1", 1)]);
        let old = backend.get_service("game", "a").unwrap();

        backend.update_services(vec![ServiceConfig::new("game", "a", "127.0.0.1", 9)]);
        let new = backend.get_service("game", "a").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.conf().port, 9);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.adds.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.removes.load(Ordering::SeqCst), 1);

        backend.stop().await;
    }

    /// 태그 변경은 레코드 교체 없이 서브 링 멤버십만 바꾼다
    #[tokio::test]
    async fn test_tag_change_keeps_peer() {
        let hooks = CountingHooks::new();
        let backend = backend_with(true, hooks.clone());

        backend.update_services(vec![
            ServiceConfig::new("game", "a", "127.0.0.1", 1).with_tags(vec!["kr".into()])
        ]);
        let peer = backend.get_service("game", "a").unwrap();

        backend.update_services(vec![
            ServiceConfig::new("game", "a", "127.0.0.1", 1).with_tags(vec!["eu".into()])
        ]);
        let same = backend.get_service("game", "a").unwrap();
        assert!(Arc::ptr_eq(&peer, &same));
        assert_eq!(same.conf().routing_tags, vec!["eu".to_string()]);

        backend.stop().await;
    }
}
