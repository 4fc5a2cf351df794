//! 인바운드 TCP 서버
//!
//! 수락된 연결 전체 인덱스와 ClientId 인덱스를 유지하고, 틱 스케줄러로
//! 유휴 연결 정리와 사용자 on_tick 호출을 수행합니다.
//!
//! # 인덱스
//! - `conn_index`: 수락된 모든 연결 (connId -> client)
//! - `client_id_index`: 외부 코드가 add_client로 등록한 부분집합.
//!   같은 id 재등록은 덮어씁니다.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::{alert_error, CurrentTime, NetError};

use crate::client::InboundClient;
use crate::config::ServerTcpConfig;
use crate::conn::{panic_message, ConnEvents, FramedConn};
use crate::dispatch::Dispatcher;
use crate::listener::TcpServerListener;
use crate::message::{Envelope, EnvelopeCodec, RpcRespCheck, Sender};
use crate::pipeline::Pipeline;
use crate::ws::WsSession;

/// 우아한 종료 예산
const GRACEFUL_STOP_BUDGET: Duration = Duration::from_secs(5);

/// 서버 수준 훅
///
/// 훅은 레지스트리 락 밖에서 호출되며, 훅 안의 패닉은 복구되어
/// 로그로 남습니다.
#[async_trait]
pub trait ServerHooks: Send + Sync + 'static {
    async fn on_connected(&self, client: &Arc<InboundClient>) {
        let _ = client;
    }

    async fn on_ws_handshake(&self, client: &Arc<InboundClient>) {
        let _ = client;
    }

    async fn on_disconnect(&self, client: &Arc<InboundClient>, err: Option<NetError>) {
        let _ = (client, err);
    }

    async fn on_tick(&self, client: &Arc<InboundClient>) {
        let _ = client;
    }
}

/// 기본 no-op 훅
pub struct NoopHooks;

#[async_trait]
impl ServerHooks for NoopHooks {}

/// 인바운드 TCP/WS 서버
pub struct InboundServer {
    cfg: ServerTcpConfig,
    listener: TcpServerListener,
    dispatcher: Arc<Dispatcher>,
    codec: Arc<dyn EnvelopeCodec>,
    hooks: Arc<dyn ServerHooks>,
    check_rpc_resp: parking_lot::RwLock<Option<RpcRespCheck>>,
    conn_index: DashMap<u64, Arc<InboundClient>>,
    client_id_index: DashMap<String, Arc<InboundClient>>,
    next_conn_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl InboundServer {
    pub fn new(
        addr: impl Into<String>,
        cfg: ServerTcpConfig,
        dispatcher: Arc<Dispatcher>,
        codec: Arc<dyn EnvelopeCodec>,
        hooks: Arc<dyn ServerHooks>,
    ) -> Arc<Self> {
        let listener = TcpServerListener::new(addr, cfg.reuse_addr);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            listener,
            dispatcher,
            codec,
            hooks,
            check_rpc_resp: parking_lot::RwLock::new(None),
            conn_index: DashMap::new(),
            client_id_index: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            stop_tx,
            tick_handle: Mutex::new(None),
        })
    }

    /// RPC 응답 판별 훅 설정. start 이전에 호출해야 새 연결에 적용됩니다.
    pub fn set_rpc_check(&self, check: RpcRespCheck) {
        *self.check_rpc_resp.write() = Some(check);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 실제 리슨 주소 (start 이후)
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// 리슨을 시작하고 틱 스케줄러를 가동합니다.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let server = Arc::downgrade(self);
        let on_accept = Arc::new(move |stream: TcpStream, peer: std::net::SocketAddr| {
            if let Some(server) = server.upgrade() {
                server.accept_conn(stream, peer);
            }
        });
        let on_shutdown = Arc::new(|| {
            debug!("리스너 종료 훅");
        });
        self.listener.start(on_accept, on_shutdown).await?;
        self.spawn_tick();
        info!(
            "인바운드 서버 시작: {} (ws={}, msg_seq={})",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.cfg.websocket,
            self.cfg.msg_seq
        );
        Ok(())
    }

    fn accept_conn(self: Arc<Self>, stream: TcpStream, peer: std::net::SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn = FramedConn::accepted(format!("accept-{}@{}", conn_id, peer), stream);

        let mut pipeline = Pipeline::new(self.codec.clone(), self.dispatcher.clone())
            .with_msg_seq(self.cfg.msg_seq);
        if let Some(check) = self.check_rpc_resp.read().clone() {
            pipeline = pipeline.with_rpc_check(check);
        }
        let ws = self
            .cfg
            .websocket
            .then(|| WsSession::new(self.cfg.ws_response_headers.clone()));
        let client =
            InboundClient::new(conn_id, conn.clone(), pipeline, ws, self.cfg.ws_text_msg_id);

        self.conn_index.insert(conn_id, client.clone());

        let events = Arc::new(ClientEvents {
            client: client.clone(),
            server: Arc::downgrade(&self),
        });
        let hooks = self.hooks.clone();
        tokio::spawn(async move {
            // 첫 메시지 처리 전에 on_connected가 완료되도록 순서 보장
            call_hook(hooks.on_connected(&client)).await;
            conn.start(events);
        });
    }

    /// ClientId 등록. 같은 id 재등록은 기존 매핑을 덮어씁니다.
    pub fn add_client(&self, id: impl Into<String>, client: Arc<InboundClient>) {
        let id = id.into();
        client.set_client_id(Some(id.clone()));
        if let Some(prev) = self.client_id_index.insert(id.clone(), client) {
            debug!("ClientId 재등록: id={} (기존 conn={})", id, prev.conn_id());
        }
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<InboundClient>> {
        self.client_id_index.get(id).map(|c| c.clone())
    }

    /// id 매핑만 제거합니다. 연결은 유지됩니다.
    pub fn remove_client(&self, id: &str) -> Option<Arc<InboundClient>> {
        let removed = self.client_id_index.remove(id).map(|(_, c)| c);
        if let Some(client) = &removed {
            client.set_client_id(None);
        }
        removed
    }

    /// on_disconnect 훅 없이 연결을 닫습니다.
    pub async fn close_client(&self, id: &str) {
        if let Some(client) = self.get_client(id) {
            client.close_silently().await;
        }
    }

    /// 모든 연결 순회. 콜백이 false를 반환하면 중단합니다.
    pub fn range_clients(&self, mut f: impl FnMut(&Arc<InboundClient>) -> bool) {
        for entry in self.conn_index.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// id로 바이트 전송
    pub async fn send(&self, id: &str, bytes: Vec<u8>) -> Result<()> {
        let client = self
            .get_client(id)
            .ok_or_else(|| NetError::NotConnected(format!("client id: {}", id)))?;
        client.send(bytes).await
    }

    /// id로 봉투 전송
    pub async fn send_msg(&self, id: &str, env: &dyn Envelope) -> Result<()> {
        let client = self
            .get_client(id)
            .ok_or_else(|| NetError::NotConnected(format!("client id: {}", id)))?;
        client.send_msg(env).await
    }

    /// 수락된 연결 수
    pub fn count(&self) -> usize {
        self.conn_index.len()
    }

    /// 진행 중 핸들러 드레인 대기 (위임)
    pub async fn wait_all_done(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_all_done(timeout).await
    }

    /// 우아한 종료: 리스너와 열린 연결에 5초 예산을 쓰고, 넘기면
    /// 남은 연결은 버립니다.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.tick_handle.lock().take() {
            handle.abort();
        }
        self.listener.stop().await;

        let clients: Vec<Arc<InboundClient>> =
            self.conn_index.iter().map(|e| e.value().clone()).collect();
        for client in &clients {
            client.close(false).await;
        }

        let deadline = tokio::time::Instant::now() + GRACEFUL_STOP_BUDGET;
        while !self.conn_index.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("우아한 종료 예산 초과: 남은 연결 {}개 버림", self.conn_index.len());
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("인바운드 서버 종료");
    }

    fn spawn_tick(self: &Arc<Self>) {
        let interval = self.cfg.tick_interval_sec;
        if interval <= 0.0 {
            return;
        }
        let server = Arc::downgrade(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let server = match server.upgrade() {
                            Some(s) => s,
                            None => break,
                        };
                        server.run_tick().await;
                    }
                    res = stop_rx.changed() => {
                        if res.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.tick_handle.lock() = Some(handle);
    }

    async fn run_tick(self: &Arc<Self>) {
        let clients: Vec<Arc<InboundClient>> =
            self.conn_index.iter().map(|e| e.value().clone()).collect();
        let now_ms = CurrentTime::now_millis();
        let timeout_ms = self.cfg.active_timeout_sec * 1000;

        for client in clients {
            // 유휴 연결 정리
            if timeout_ms > 0 && now_ms - client.conn().last_activity_ms() > timeout_ms {
                warn!(
                    "유휴 연결 정리: {} ({}초 무응답)",
                    client.conn_name(),
                    self.cfg.active_timeout_sec
                );
                client.close_with_reason(NetError::ActiveTimeout).await;
                continue;
            }

            // 사용자 틱: msg_seq면 순차 실행기로, 아니면 공용 워커로
            let hooks = self.hooks.clone();
            let c = client.clone();
            let tick = async move {
                call_hook(hooks.on_tick(&c)).await;
            };
            if self.cfg.msg_seq {
                client.sequencer().submit(tick);
            } else {
                tokio::spawn(tick);
            }
        }
    }

    /// 연결 종료 시 인덱스 정리 (클라이언트 이벤트 어댑터가 호출)
    fn detach(&self, client: &Arc<InboundClient>) {
        self.conn_index.remove(&client.conn_id());
        if let Some(id) = client.client_id() {
            // 같은 id가 다른 연결로 재등록된 경우는 남겨둔다
            self.client_id_index
                .remove_if(&id, |_, current| current.conn_id() == client.conn_id());
        }
    }
}

/// FramedConn 이벤트를 클라이언트/서버에 연결하는 어댑터
struct ClientEvents {
    client: Arc<InboundClient>,
    server: Weak<InboundServer>,
}

#[async_trait]
impl ConnEvents for ClientEvents {
    async fn on_recv(&self, buf: &[u8]) -> Result<usize> {
        let was_done = self
            .client
            .ws_session()
            .map(|ws| ws.is_handshake_done())
            .unwrap_or(true);

        let consumed = self.client.handle_recv(buf).await?;

        // 핸드셰이크가 이번 소비에서 완료되었으면 훅 발화
        if !was_done {
            let now_done = self
                .client
                .ws_session()
                .map(|ws| ws.is_handshake_done())
                .unwrap_or(false);
            if now_done {
                if let Some(server) = self.server.upgrade() {
                    call_hook(server.hooks.on_ws_handshake(&self.client)).await;
                }
            }
        }
        Ok(consumed)
    }

    async fn on_disconnect(&self, err: Option<NetError>) -> Option<NetError> {
        self.client.rpc().purge();
        let reason = self.client.take_close_reason().or(err);

        if let Some(server) = self.server.upgrade() {
            server.detach(&self.client);
            if !self.client.hook_suppressed() {
                call_hook(server.hooks.on_disconnect(&self.client, reason)).await;
            }
        }
        None
    }
}

/// 훅 패닉 격리 래퍼
pub(crate) async fn call_hook(fut: impl std::future::Future<Output = ()>) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        alert_error!("Panic in hook: {}", panic_message(&panic));
    }
}
