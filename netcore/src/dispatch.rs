//! 메시지 디스패처
//!
//! 메시지 id로 핸들러를 찾아 타입 디코드 후 호출합니다. 핸들러는
//! 네 가지 형태의 등록 빌더로 등록하며, 내부적으로는 공통 invoke
//! 클로저로 소거(erase)되어 `map<messageId, entry>`에 저장됩니다.
//!
//! | 형태 | 파라미터 | 종류 |
//! |------|----------|------|
//! | A | (conn, msg) | 단방향 |
//! | B | (env, conn, msg) | 단방향 + 봉투 |
//! | C | (conn, req) -> resp | 요청/응답 |
//! | D | (env, conn, req) -> resp | 요청/응답 + 봉투 |
//!
//! 요청/응답 형태는 핸들러가 돌려준 응답 페이로드를 인코딩해
//! `envelope.build_response`로 봉투를 만들어 연결로 돌려보냅니다.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use shared::{alert_error, BreakerTable};

use crate::config::DispatchConfig;
use crate::conn::panic_message;
use crate::message::{ConnRef, Envelope, Message};
use crate::sequencer::Sequencer;

/// 핸들러 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    OneWay,
    ReqResp,
}

type Invoker =
    Arc<dyn Fn(Arc<dyn Envelope>, ConnRef) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    kind: HandlerKind,
    with_envelope: bool,
    invoker: Invoker,
}

/// 진행 중 카운터. 종료 시 핸들러 드레인 대기에 사용.
#[derive(Default)]
struct Inflight {
    count: AtomicI64,
    notify: Notify,
}

impl Inflight {
    fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn dec(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// dec를 Drop으로 보장하는 가드
struct InflightGuard(Arc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// 메시지 디스패처
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    breakers: Arc<BreakerTable>,
    ignore_msg_ids: RwLock<HashSet<String>>,
    timeout_check_sec: AtomicI64,
    inflight: Arc<Inflight>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(BreakerTable::new()))
    }
}

impl Dispatcher {
    pub fn new(breakers: Arc<BreakerTable>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            breakers,
            ignore_msg_ids: RwLock::new(HashSet::new()),
            timeout_check_sec: AtomicI64::new(0),
            inflight: Arc::new(Inflight::default()),
        }
    }

    /// 설정 적용. 브레이커 이름은 `msg_<id>`로 매핑됩니다.
    pub fn apply_config(&self, cfg: &DispatchConfig) {
        *self.ignore_msg_ids.write() = cfg.ignore_msg_ids.iter().cloned().collect();
        self.timeout_check_sec
            .store(cfg.timeout_check_sec, Ordering::Release);
        let breaker_configs = cfg
            .hystrix
            .iter()
            .map(|(id, bc)| (format!("msg_{}", id), bc.clone()))
            .collect();
        self.breakers.set_configs(breaker_configs);
    }

    /// 등록된 핸들러 수
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// 형태 A: `(conn, msg)` 단방향 핸들러
    pub fn one_way<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(ConnRef, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |env, conn| {
            let handler = handler.clone();
            async move {
                let msg = M::decode(env.payload())?;
                handler(conn, msg).await
            }
            .boxed()
        });
        self.insert::<M>(HandlerKind::OneWay, false, invoker);
    }

    /// 형태 B: `(envelope, conn, msg)` 단방향 핸들러
    pub fn one_way_env<M, F, Fut>(&self, handler: F)
    where
        M: Message,
        F: Fn(Arc<dyn Envelope>, ConnRef, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |env, conn| {
            let handler = handler.clone();
            async move {
                let msg = M::decode(env.payload())?;
                handler(env, conn, msg).await
            }
            .boxed()
        });
        self.insert::<M>(HandlerKind::OneWay, true, invoker);
    }

    /// 형태 C: `(conn, req) -> resp` 요청/응답 핸들러
    ///
    /// 프레임워크가 응답 페이로드를 인코딩해 요청 봉투의
    /// `build_response`로 감싸 전송합니다.
    pub fn req_resp<M, R, F, Fut>(&self, handler: F)
    where
        M: Message,
        R: Message,
        F: Fn(ConnRef, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |env, conn| {
            let handler = handler.clone();
            async move {
                let req = M::decode(env.payload())?;
                let resp = handler(conn.clone(), req).await?;
                send_response::<R>(env.as_ref(), &conn, &resp).await
            }
            .boxed()
        });
        self.insert::<M>(HandlerKind::ReqResp, false, invoker);
    }

    /// 형태 D: `(envelope, conn, req) -> resp` 요청/응답 핸들러
    pub fn req_resp_env<M, R, F, Fut>(&self, handler: F)
    where
        M: Message,
        R: Message,
        F: Fn(Arc<dyn Envelope>, ConnRef, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |env, conn| {
            let handler = handler.clone();
            async move {
                let req = M::decode(env.payload())?;
                let resp = handler(env.clone(), conn.clone(), req).await?;
                send_response::<R>(env.as_ref(), &conn, &resp).await
            }
            .boxed()
        });
        self.insert::<M>(HandlerKind::ReqResp, true, invoker);
    }

    /// 같은 id를 다시 등록하면 마지막 등록이 이깁니다.
    fn insert<M: Message>(&self, kind: HandlerKind, with_envelope: bool, invoker: Invoker) {
        let id = M::message_id().to_string();
        let prev = self.handlers.write().insert(
            id.clone(),
            HandlerEntry {
                kind,
                with_envelope,
                invoker,
            },
        );
        if prev.is_some() {
            warn!("핸들러 재등록: id={} (마지막 등록이 우선)", id);
        }
    }

    /// 봉투를 핸들러로 디스패치합니다.
    ///
    /// 반환 false = 핸들러 없음. 핸들러 실행은 `seq`가 있으면 해당
    /// 순차 실행기에, 없으면 공용 런타임에 제출되어 비동기로 진행됩니다.
    pub fn dispatch(
        &self,
        env: Arc<dyn Envelope>,
        conn: ConnRef,
        seq: Option<Arc<Sequencer>>,
    ) -> bool {
        let msg_id = env.message_id().to_string();
        let entry = match self.handlers.read().get(&msg_id) {
            Some(e) => e.clone(),
            None => return false,
        };

        if !self.ignore_msg_ids.read().contains(&msg_id) {
            debug!(
                "메시지 디스패치: id={} conn={} kind={:?} with_env={} env={}",
                msg_id,
                conn.conn_name(),
                entry.kind,
                entry.with_envelope,
                env.header()
            );
        }

        self.inflight.inc();
        let guard = InflightGuard(self.inflight.clone());
        let breakers = self.breakers.clone();
        let timeout_check = self.timeout_check_sec.load(Ordering::Acquire);
        let conn_name = conn.conn_name();

        let fut = async move {
            let _guard = guard;

            // 지연 관찰: 핸들러를 취소하지 않고 경고만 남긴다
            let _done_tx = if timeout_check > 0 {
                let (done_tx, done_rx) = oneshot::channel::<()>();
                let id = msg_id.clone();
                let name = conn_name.clone();
                tokio::spawn(async move {
                    let limit = Duration::from_secs(timeout_check as u64);
                    if tokio::time::timeout(limit, done_rx).await.is_err() {
                        alert_error!(
                            "MsgDispatch handle message timeout: id={} conn={}",
                            id,
                            name
                        );
                    }
                });
                Some(done_tx)
            } else {
                None
            };

            let breaker_name = format!("msg_{}", msg_id);
            let invoke = (entry.invoker)(env.clone(), conn);
            let gated = breakers.run_under(&breaker_name, invoke);
            match AssertUnwindSafe(gated).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // 브레이커 차단 포함: 로그만 남기고 연결은 유지
                    alert_error!("MsgDispatch handler error: id={} err={:#}", msg_id, e);
                }
                Err(panic) => {
                    alert_error!(
                        "Panic in handler: id={} msg={}",
                        msg_id,
                        panic_message(&panic)
                    );
                }
            }
        };

        match seq {
            Some(seq) => seq.submit(fut),
            None => {
                tokio::spawn(fut);
            }
        }
        true
    }

    /// 진행 중인 핸들러가 모두 끝날 때까지 대기합니다.
    ///
    /// 반환 false = 제한 시간 내에 드레인하지 못함.
    pub async fn wait_all_done(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inflight.count.load(Ordering::Acquire) <= 0 {
                return true;
            }
            let notified = self.inflight.notify.notified();
            tokio::pin!(notified);
            if self.inflight.count.load(Ordering::Acquire) <= 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inflight.count.load(Ordering::Acquire) <= 0;
            }
        }
    }
}

/// 응답 페이로드를 봉투로 감싸 전송
async fn send_response<R: Message>(
    env: &dyn Envelope,
    conn: &ConnRef,
    resp: &R,
) -> Result<()> {
    let body = resp.encode()?;
    match env.build_response(R::message_id(), body) {
        Some(out) => conn.send_msg(out.as_ref()).await,
        None => {
            debug!(
                "응답 봉투를 만들 수 없음: req={} resp_id={}",
                env.header(),
                R::message_id()
            );
            Ok(())
        }
    }
}
