//! 공통 에러 처리 시스템
//!
//! 프레임워크 전역에서 발생하는 에러를 체계적으로 분류합니다.
//! 각 에러는 연결/프로토콜/인코딩/RPC/디스패치 계층으로 나뉘며,
//! 호출자가 variant 매칭으로 처리 경로를 구분할 수 있습니다.

use thiserror::Error;

/// 네트워크 프레임워크 공통 에러
///
/// 전송 계층 에러는 해당 연결에 한정되며 프로세스를 중단시키지 않습니다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    // 연결 관련 에러
    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("send timeout: 전송 큐 대기 시간 초과")]
    SendTimeout,

    #[error("send queue closed: 연결이 이미 종료되었습니다")]
    SendQueueClosed,

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("connection stopped")]
    Stopped,

    // 프로토콜 관련 에러
    #[error("protocol error: {0}")]
    Protocol(String),

    // 직렬화/역직렬화 에러
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    // RPC 관련 에러
    #[error("rpc timeout")]
    RpcTimeout,

    #[error("rpc close")]
    RpcClosed,

    #[error("rpc duplicate id: {0}")]
    RpcDuplicateId(u64),

    // 디스패치 관련 에러
    #[error("no handler for message id: {0}")]
    NoHandler(String),

    #[error("handler panic: {0}")]
    HandlerPanic(String),

    #[error("circuit breaker open: {0}")]
    BreakerOpen(String),

    #[error("circuit breaker max concurrency: {0}")]
    BreakerConcurrency(String),

    #[error("circuit breaker timeout: {0}")]
    BreakerTimeout(String),

    // 유휴 연결 정리
    #[error("activetimeout")]
    ActiveTimeout,

    // 설정 관련 에러
    #[error("config load error: {0}")]
    ConfigLoad(String),

    // 서비스 디스커버리 관련 에러
    #[error("service not found: {0}")]
    ServiceNotFound(String),
}

impl NetError {
    /// 전송 계층 에러 여부 (해당 연결에 대해 치명적)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NetError::DialFailed(_)
                | NetError::NotConnected(_)
                | NetError::SendQueueClosed
                | NetError::Stopped
                | NetError::Protocol(_)
        )
    }

    /// 호출자에게 반환되며 연결에는 영향이 없는 에러 여부
    pub fn is_caller_only(&self) -> bool {
        matches!(
            self,
            NetError::SendTimeout | NetError::Encode(_) | NetError::RpcDuplicateId(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_keywords() {
        assert!(NetError::SendTimeout.to_string().starts_with("send timeout"));
        assert_eq!(NetError::RpcTimeout.to_string(), "rpc timeout");
        assert_eq!(NetError::RpcClosed.to_string(), "rpc close");
        assert_eq!(NetError::ActiveTimeout.to_string(), "activetimeout");
    }

    #[test]
    fn test_error_classification() {
        assert!(NetError::Protocol("bad length".into()).is_transport());
        assert!(NetError::SendTimeout.is_caller_only());
        assert!(!NetError::SendTimeout.is_transport());
    }
}
