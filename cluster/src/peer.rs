//! 아웃바운드 피어
//!
//! 발견된 서비스 인스턴스 하나로의 dial 모드 연결입니다. 접속에
//! 성공하면 그룹의 메인 링과 태그 서브 링에 합류하고, 끊어지면
//! 이탈합니다. config가 파기된(configDestroyed) 피어는 다음 단절 시
//! 영구 종료되어 그룹에서 제거됩니다.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use netcore::conn::FramedConn;
use netcore::message::{ConnRef, Envelope, Sender};
use netcore::pipeline::Pipeline;
use netcore::rpc::RpcTable;
use netcore::sequencer::Sequencer;
use shared::NetError;

use crate::group::Group;
use crate::registry::ServiceConfig;

/// 아웃바운드 피어 연결
pub struct Peer {
    conf: RwLock<ServiceConfig>,
    conn: Arc<FramedConn>,
    pipeline: Pipeline,
    rpc: RpcTable,
    seq: Arc<Sequencer>,
    /// 사용자 정의 ServiceInfo
    info: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    config_destroyed: AtomicBool,
    /// on_remove 훅과 그룹 제거의 1회 실행 보장
    removed: AtomicBool,
    group: Weak<Group>,
}

impl Peer {
    pub(crate) fn new(
        conf: ServiceConfig,
        conn: Arc<FramedConn>,
        pipeline: Pipeline,
        group: Weak<Group>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conf: RwLock::new(conf),
            conn,
            pipeline,
            rpc: RpcTable::new(),
            seq: Sequencer::new(),
            info: RwLock::new(None),
            config_destroyed: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            group,
        })
    }

    /// 현재 디스커버리 레코드 사본
    pub fn conf(&self) -> ServiceConfig {
        self.conf.read().clone()
    }

    pub fn id(&self) -> String {
        self.conf.read().id.clone()
    }

    pub fn service_name(&self) -> String {
        self.conf.read().name.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn conn(&self) -> &Arc<FramedConn> {
        &self.conn
    }

    pub fn rpc(&self) -> &RpcTable {
        &self.rpc
    }

    /// 사용자 정의 정보 저장
    pub fn set_info<T: Any + Send + Sync>(&self, info: T) {
        *self.info.write() = Some(Arc::new(info));
    }

    /// 사용자 정의 정보 조회
    pub fn info<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.info
            .read()
            .clone()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn is_destroyed(&self) -> bool {
        self.config_destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.config_destroyed.store(true, Ordering::Release);
    }

    /// 같은 endpoint의 레코드가 다시 나타난 경우 파기 취소
    pub(crate) fn clear_destroyed(&self) {
        self.config_destroyed.store(false, Ordering::Release);
    }

    pub(crate) fn set_conf(&self, conf: ServiceConfig) {
        *self.conf.write() = conf;
    }

    /// 제거 1회 실행 선점. true면 호출자가 제거 절차를 진행합니다.
    pub(crate) fn claim_removal(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    /// 원시 바이트 전송
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.conn.send(bytes).await
    }

    /// RPC 호출: 응답/종료/타임아웃 중 정확히 하나로 끝납니다.
    pub async fn send_rpc_msg(
        &self,
        rpc_id: u64,
        env: &dyn Envelope,
        timeout: Duration,
    ) -> Result<Arc<dyn Envelope>> {
        // 인코딩 실패는 대기자 등록 전에 반환 (상태 변화 없음)
        let bytes = env
            .encode()
            .map_err(|e| NetError::Encode(e.to_string()))?;
        let send = async move { self.conn.send(bytes).await };
        self.rpc.call(rpc_id, send, timeout).await
    }

    /// 종료 신호 (동기). update_services의 즉시 제거 경로에서 사용.
    pub(crate) fn shutdown(&self) {
        self.conn.shutdown();
    }

    pub async fn close(&self, wait: bool) {
        self.conn.close(wait).await;
    }

    /// 연결을 끊고 1초 후 재접속
    pub fn reconnect(&self) {
        self.conn.reconnect();
    }

    /// 수신 바이트를 파이프라인으로 소비
    pub(crate) fn consume_recv(self: &Arc<Self>, buf: &[u8]) -> Result<usize> {
        let conn_ref: ConnRef = self.clone();
        self.pipeline.consume(buf, &conn_ref, &self.rpc, &self.seq)
    }

    /// 링 합류 (연결 성공 시)
    pub(crate) fn join_rings(&self) {
        if let Some(group) = self.group.upgrade() {
            let conf = self.conf.read();
            group.join_rings(&conf.id, &conf.routing_tags);
        }
    }

    /// 링 이탈 (단절 또는 config 파기 시)
    pub(crate) fn leave_rings(&self) {
        if let Some(group) = self.group.upgrade() {
            let conf = self.conf.read();
            group.leave_rings(&conf.id, &conf.routing_tags);
        }
    }

    pub(crate) fn group(&self) -> Option<Arc<Group>> {
        self.group.upgrade()
    }
}

#[async_trait]
impl Sender for Peer {
    async fn send_msg(&self, env: &dyn Envelope) -> Result<()> {
        let bytes = env
            .encode()
            .map_err(|e| NetError::Encode(e.to_string()))?;
        self.conn.send(bytes).await
    }

    fn conn_name(&self) -> String {
        let conf = self.conf.read();
        format!("peer-{}-{}@{}", conf.name, conf.id, conf.endpoint())
    }
}
