//! RPC 요청/응답 상관
//!
//! 연결마다 rpcId -> 대기자 채널 테이블을 유지합니다. 대기자 채널은
//! 삭제하는 쪽이 정확히 한 번 닫으며(oneshot 소비), 연결이 끊어지면
//! 모든 대기자에게 종료 신호를 보냅니다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use shared::NetError;

use crate::message::Envelope;

/// 대기자에게 전달되는 값. `None`은 연결 종료(close) 신호입니다.
type RpcValue = Option<Arc<dyn Envelope>>;

/// 연결별 RPC 대기자 테이블
#[derive(Default)]
pub struct RpcTable {
    waiters: DashMap<u64, oneshot::Sender<RpcValue>>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 현재 대기자 수
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn has_waiter(&self, rpc_id: u64) -> bool {
        self.waiters.contains_key(&rpc_id)
    }

    /// 수신 봉투를 대기자에게 전달합니다.
    ///
    /// 반환 false면 대기자가 없으므로 일반 디스패치로 넘어가야 합니다
    /// (늦게 도착한 응답 또는 오분류).
    pub fn complete(&self, rpc_id: u64, env: Arc<dyn Envelope>) -> bool {
        match self.waiters.remove(&rpc_id) {
            Some((_, tx)) => {
                let _ = tx.send(Some(env));
                true
            }
            None => false,
        }
    }

    /// 연결 종료 시 모든 대기자에게 close를 알리고 테이블을 비웁니다.
    pub fn purge(&self) {
        let ids: Vec<u64> = self.waiters.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(None);
            }
        }
    }

    /// RPC 호출 한 건을 수행합니다.
    ///
    /// 등록 -> 전송 -> 대기 순서이며, 모든 경로에서 대기자는 정확히
    /// 한 번 삭제됩니다. 결과는 응답/`RpcTimeout`/`RpcClosed` 중
    /// 정확히 하나입니다.
    pub async fn call<F>(&self, rpc_id: u64, send: F, timeout: Duration) -> Result<Arc<dyn Envelope>>
    where
        F: Future<Output = Result<()>>,
    {
        let (tx, rx) = oneshot::channel::<RpcValue>();
        // putIfAbsent: 같은 id의 대기자가 살아 있으면 에러
        match self.waiters.entry(rpc_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NetError::RpcDuplicateId(rpc_id).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // 전송 실패 시 대기자 즉시 회수
        if let Err(e) = send.await {
            self.waiters.remove(&rpc_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        // 타임아웃 경로에서도 대기자를 정리한다. 늦게 도착한 응답은
        // 대기자가 없으므로 일반 onMsg 경로로 흐른다.
        self.waiters.remove(&rpc_id);

        match outcome {
            Err(_) => {
                debug!("rpc 타임아웃: id={}", rpc_id);
                Err(NetError::RpcTimeout.into())
            }
            Ok(Err(_recv_closed)) => Err(NetError::RpcClosed.into()),
            Ok(Ok(None)) => Err(NetError::RpcClosed.into()),
            Ok(Ok(Some(env))) => Ok(env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinEnvelope;

    fn env(id: u32, body: &[u8]) -> Arc<dyn Envelope> {
        Arc::new(BinEnvelope::new(id, body.to_vec()))
    }

    #[tokio::test]
    async fn test_call_receives_response() {
        let table = Arc::new(RpcTable::new());
        let t = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(t.complete(7, env(101, b"pong")));
        });

        let resp = table
            .call(7, async { Ok(()) }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.payload(), b"pong");
        assert_eq!(table.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_call_timeout_removes_waiter() {
        let table = RpcTable::new();
        let err = table
            .call(8, async { Ok(()) }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::RpcTimeout)
        ));
        assert!(!table.has_waiter(8));

        // 늦은 응답은 대기자가 없어 false
        assert!(!table.complete(8, env(1, b"late")));
    }

    #[tokio::test]
    async fn test_duplicate_rpc_id_rejected() {
        let table = Arc::new(RpcTable::new());
        let t = table.clone();
        let first = tokio::spawn(async move {
            t.call(5, async { Ok(()) }, Duration::from_millis(300)).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = table
            .call(5, async { Ok(()) }, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::RpcDuplicateId(5))
        ));

        // 첫 호출은 자체 타임아웃으로 정리됨
        let first = first.await.unwrap();
        assert!(first.is_err());
        assert_eq!(table.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_signals_close() {
        let table = Arc::new(RpcTable::new());
        let t = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            t.purge();
        });

        let err = table
            .call(9, async { Ok(()) }, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::RpcClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_failure_cleans_up() {
        let table = RpcTable::new();
        let err = table
            .call(
                11,
                async { Err(NetError::SendTimeout.into()) },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::SendTimeout)
        ));
        assert!(!table.has_waiter(11));
    }
}
