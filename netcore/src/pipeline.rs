//! 수신 파이프라인
//!
//! 코덱 디코드 -> RPC 응답 분리 -> 디스패치 -> (옵션) 연결별 순차
//! 실행의 공통 경로입니다. 인바운드 클라이언트와 아웃바운드 피어가
//! 같은 파이프라인을 공유합니다.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::message::{ConnRef, Envelope, EnvelopeCodec, RpcRespCheck};
use crate::rpc::RpcTable;
use crate::sequencer::Sequencer;

/// 연결 하나의 수신 경로
pub struct Pipeline {
    codec: Arc<dyn EnvelopeCodec>,
    dispatcher: Arc<Dispatcher>,
    check_rpc_resp: Option<RpcRespCheck>,
    msg_seq: bool,
}

impl Pipeline {
    pub fn new(codec: Arc<dyn EnvelopeCodec>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            codec,
            dispatcher,
            check_rpc_resp: None,
            msg_seq: true,
        }
    }

    /// RPC 응답 판별 훅 설정
    pub fn with_rpc_check(mut self, check: RpcRespCheck) -> Self {
        self.check_rpc_resp = Some(check);
        self
    }

    /// 연결별 순차 실행 여부 설정
    pub fn with_msg_seq(mut self, msg_seq: bool) -> Self {
        self.msg_seq = msg_seq;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// 버퍼에서 봉투를 반복 디코드해 전달하고, 소비한 바이트 수를
    /// 반환합니다. 코덱 에러는 프로토콜 위반으로 전파됩니다.
    pub fn consume(
        &self,
        buf: &[u8],
        conn: &ConnRef,
        rpc: &RpcTable,
        seq: &Arc<Sequencer>,
    ) -> Result<usize> {
        let mut consumed = 0;
        while let Some((env, n)) = self.codec.decode(&buf[consumed..])? {
            consumed += n;
            let env: Arc<dyn Envelope> = Arc::from(env);
            self.deliver(env, conn, rpc, seq);
        }
        Ok(consumed)
    }

    /// 디코딩된 봉투 한 건을 전달합니다 (WS 텍스트 등 외부 디코더용).
    ///
    /// RPC 응답은 디스패치와 순차 실행기를 거치지 않고 대기자에게 바로
    /// 전달됩니다. 대기자가 없으면(늦은 응답) 일반 경로로 넘어갑니다.
    pub fn deliver(
        &self,
        env: Arc<dyn Envelope>,
        conn: &ConnRef,
        rpc: &RpcTable,
        seq: &Arc<Sequencer>,
    ) {
        if let Some(check) = &self.check_rpc_resp {
            if let Some(rpc_id) = check(env.as_ref()) {
                if rpc.complete(rpc_id, env.clone()) {
                    return;
                }
            }
        }
        let seq = if self.msg_seq { Some(seq.clone()) } else { None };
        if !self.dispatcher.dispatch(env.clone(), conn.clone(), seq) {
            debug!(
                "처리되지 않은 메시지: id={} conn={}",
                env.message_id(),
                conn.conn_name()
            );
        }
    }
}
