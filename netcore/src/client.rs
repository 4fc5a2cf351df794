//! 인바운드 클라이언트
//!
//! 수락된 연결 하나와 사용자 정의 ClientInfo를 묶습니다. 외부 코드가
//! ClientId(예: 인증된 사용자 id)로 등록하면 id 기반 조회/전송이
//! 가능해집니다.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, RwLock};

use shared::NetError;

use crate::conn::FramedConn;
use crate::message::{ConnRef, Envelope, Sender};
use crate::pipeline::Pipeline;
use crate::rpc::RpcTable;
use crate::sequencer::Sequencer;
use crate::ws::{self, WsEvent, WsSession};

/// 수락된 연결 하나
pub struct InboundClient {
    conn_id: u64,
    conn: Arc<FramedConn>,
    pipeline: Pipeline,
    rpc: RpcTable,
    seq: Arc<Sequencer>,
    ws: Option<WsSession>,
    /// WS 바이너리 프레임 페이로드 누적 버퍼 (내부 파이프라인 입력)
    ws_inner: Mutex<BytesMut>,
    ws_text_msg_id: u32,
    info: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    client_id: RwLock<Option<String>>,
    /// 틱 스케줄러가 지정한 합성 종료 사유 (예: activetimeout)
    close_reason: Mutex<Option<NetError>>,
    /// close_client 경로: on_disconnect 훅 발화 억제
    suppress_disconnect_hook: AtomicBool,
}

impl InboundClient {
    pub(crate) fn new(
        conn_id: u64,
        conn: Arc<FramedConn>,
        pipeline: Pipeline,
        ws: Option<WsSession>,
        ws_text_msg_id: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            conn,
            pipeline,
            rpc: RpcTable::new(),
            seq: Sequencer::new(),
            ws,
            ws_inner: Mutex::new(BytesMut::new()),
            ws_text_msg_id,
            info: RwLock::new(None),
            client_id: RwLock::new(None),
            close_reason: Mutex::new(None),
            suppress_disconnect_hook: AtomicBool::new(false),
        })
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn conn(&self) -> &Arc<FramedConn> {
        &self.conn
    }

    pub(crate) fn sequencer(&self) -> &Arc<Sequencer> {
        &self.seq
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
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

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub(crate) fn set_client_id(&self, id: Option<String>) {
        *self.client_id.write() = id;
    }

    /// 실제 원격 주소: WS 업그레이드 헤더 우선, 없으면 소켓 주소
    pub fn remote_addr(&self) -> Option<String> {
        self.ws
            .as_ref()
            .and_then(|ws| ws.real_addr())
            .or_else(|| self.conn.peer_addr())
    }

    /// 원시 바이트 전송. WS 연결이면 바이너리 프레임으로 감쌉니다.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        match &self.ws {
            Some(ws) if ws.is_handshake_done() => self.conn.send(ws::binary_frame(&bytes)).await,
            Some(_) => Err(NetError::NotConnected("ws 핸드셰이크 전".into()).into()),
            None => self.conn.send(bytes).await,
        }
    }

    /// WS 텍스트 프레임 전송
    pub async fn send_text(&self, bytes: Vec<u8>) -> Result<()> {
        match &self.ws {
            Some(ws) if ws.is_handshake_done() => self.conn.send(ws::text_frame(&bytes)).await,
            _ => Err(NetError::NotConnected("ws 연결이 아님".into()).into()),
        }
    }

    /// RPC 호출: 전송 후 응답/종료/타임아웃 중 하나를 기다립니다.
    pub async fn send_rpc_msg(
        &self,
        rpc_id: u64,
        env: &dyn Envelope,
        timeout: Duration,
    ) -> Result<Arc<dyn Envelope>> {
        // 인코딩 실패는 대기자 등록 전에 반환 (상태 변화 없음)
        let is_text = env.is_text();
        let bytes = if is_text {
            // 텍스트 프레임은 봉투 헤더 없이 페이로드 그대로 나간다
            env.payload().to_vec()
        } else {
            env.encode().map_err(|e| NetError::Encode(e.to_string()))?
        };
        let send = async move {
            if is_text {
                self.send_text(bytes).await
            } else {
                self.send(bytes).await
            }
        };
        self.rpc.call(rpc_id, send, timeout).await
    }

    pub fn rpc(&self) -> &RpcTable {
        &self.rpc
    }

    /// 연결 종료. 이벤트 콜백 안에서는 wait=false만 허용됩니다.
    pub async fn close(&self, wait: bool) {
        self.conn.close(wait).await;
    }

    /// 합성 사유와 함께 종료 (틱 스케줄러의 유휴 정리 등)
    pub(crate) async fn close_with_reason(&self, reason: NetError) {
        *self.close_reason.lock() = Some(reason);
        self.conn.close(false).await;
    }

    /// on_disconnect 훅 없이 종료 (closeClient 연산)
    pub(crate) async fn close_silently(&self) {
        self.suppress_disconnect_hook.store(true, Ordering::Release);
        self.conn.close(false).await;
    }

    pub(crate) fn hook_suppressed(&self) -> bool {
        self.suppress_disconnect_hook.load(Ordering::Acquire)
    }

    pub(crate) fn take_close_reason(&self) -> Option<NetError> {
        self.close_reason.lock().take()
    }

    /// 연결 드라이버의 on_recv 구현부
    ///
    /// 반환값은 소비한 바이트 수입니다. WS 모드에서는 핸드셰이크와
    /// 프레임 해석을 거쳐 내부 파이프라인으로 전달합니다.
    pub(crate) async fn handle_recv(self: &Arc<Self>, buf: &[u8]) -> Result<usize> {
        let conn_ref: ConnRef = self.clone();
        let ws = match &self.ws {
            None => {
                // 원시 TCP: 코덱으로 바로 소비
                return self.pipeline.consume(buf, &conn_ref, &self.rpc, &self.seq);
            }
            Some(ws) => ws,
        };

        let mut consumed = 0usize;
        if !ws.is_handshake_done() {
            match ws.try_handshake(buf)? {
                None => return Ok(0),
                Some((n, response)) => {
                    consumed = n;
                    self.conn.send(response).await?;
                    // 같은 읽기에 붙어 온 나머지 바이트는 아래 프레임 루프가 처리
                }
            }
        }

        while let Some((n, event)) = ws.parse_frame(&buf[consumed..])? {
            consumed += n;
            match event {
                WsEvent::Message {
                    text: false,
                    payload,
                } => {
                    let mut inner = self.ws_inner.lock();
                    inner.extend_from_slice(&payload);
                    let used =
                        self.pipeline
                            .consume(&inner[..], &conn_ref, &self.rpc, &self.seq)?;
                    inner.advance(used);
                }
                WsEvent::Message {
                    text: true,
                    payload,
                } => {
                    let env: Arc<dyn Envelope> = Arc::new(
                        crate::codec::BinEnvelope::new_text(self.ws_text_msg_id, payload),
                    );
                    self.pipeline.deliver(env, &conn_ref, &self.rpc, &self.seq);
                }
                WsEvent::Ping(payload) => {
                    self.conn.send(ws::pong_frame(&payload)).await?;
                }
                WsEvent::Pong => {}
                WsEvent::Close => {
                    self.conn.send(ws::close_frame()).await.ok();
                    // 콜백 내부이므로 wait 없이 종료
                    self.conn.close(false).await;
                    return Ok(consumed);
                }
                WsEvent::Partial => {}
            }
        }
        Ok(consumed)
    }

    /// WS 핸드셰이크가 방금 끝났는지 (훅 발화용)
    pub(crate) fn ws_session(&self) -> Option<&WsSession> {
        self.ws.as_ref()
    }
}

#[async_trait]
impl Sender for InboundClient {
    async fn send_msg(&self, env: &dyn Envelope) -> Result<()> {
        if env.is_text() {
            // 텍스트 프레임은 봉투 헤더 없이 페이로드 그대로 나간다
            self.send_text(env.payload().to_vec()).await
        } else {
            let bytes = env
                .encode()
                .map_err(|e| NetError::Encode(e.to_string()))?;
            self.send(bytes).await
        }
    }

    fn conn_name(&self) -> String {
        match self.remote_addr() {
            Some(addr) => format!("inbound-{}@{}", self.conn_id, addr),
            None => format!("inbound-{}", self.conn_id),
        }
    }
}
