//! 메시지 계약
//!
//! 프레임워크는 메시지 포맷에 독립적입니다. 사용자는 페이로드 타입에
//! [`Message`]를, 외부 봉투 타입에 [`Envelope`]를 구현하고, 바이트
//! 스트림에서 봉투를 잘라내는 [`EnvelopeCodec`]을 제공합니다.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// 메시지 페이로드 계약
///
/// 디스패처는 이 트레잇으로 페이로드 타입에서 메시지 id를 얻고
/// 바이트 <-> 타입 변환을 수행합니다.
pub trait Message: Sized + Send + Sync + 'static {
    /// 디스패치 키. 같은 id를 가진 핸들러가 이 타입으로 역직렬화합니다.
    fn message_id() -> &'static str;

    fn decode(buf: &[u8]) -> Result<Self>;

    fn encode(&self) -> Result<Vec<u8>>;
}

/// 외부 봉투 계약
///
/// 디코딩된 한 건의 수신 단위입니다. 헤더와 원본 페이로드를 들고
/// 있으며, 요청 봉투라면 응답 봉투를 만들 수 있습니다.
pub trait Envelope: Send + Sync + fmt::Debug {
    /// 디스패치 키
    fn message_id(&self) -> &str;

    /// 로깅/라우팅용 구조 헤더 표현
    fn header(&self) -> String;

    /// 원본 페이로드 바이트
    fn payload(&self) -> &[u8];

    /// WS 텍스트 프레임으로 수신된 봉투 여부
    fn is_text(&self) -> bool {
        false
    }

    /// 전송 가능한 바이트로 인코딩
    fn encode(&self) -> Result<Vec<u8>>;

    /// 응답 봉투 생성. 요청 봉투가 아니면 None.
    fn build_response(&self, msg_id: &str, body: Vec<u8>) -> Option<Box<dyn Envelope>>;
}

/// 바이트 스트림에서 봉투를 잘라내는 코덱
///
/// `decode`는 완성된 봉투가 없으면 `Ok(None)`, 있으면 봉투와 소비한
/// 바이트 수를 반환합니다. 에러는 프로토콜 위반으로 간주되어 연결이
/// 종료됩니다.
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn decode(&self, buf: &[u8]) -> Result<Option<(Box<dyn Envelope>, usize)>>;
}

/// 송신자 계약
///
/// 피어/인바운드 클라이언트가 구현합니다.
#[async_trait]
pub trait Sender: Send + Sync {
    /// 봉투를 인코딩하여 전송 큐에 넣습니다.
    async fn send_msg(&self, env: &dyn Envelope) -> Result<()>;

    /// 로깅용 연결 이름
    fn conn_name(&self) -> String;
}

/// 디스패처가 핸들러에 넘기는 연결 참조
pub type ConnRef = Arc<dyn Sender>;

/// RPC 응답 판별 훅
///
/// 수신 파이프라인이 봉투마다 호출하며, rpcId를 돌려주면 해당 봉투는
/// 디스패치 대신 대기 중인 RPC 호출에 전달됩니다.
pub type RpcRespCheck = Arc<dyn Fn(&dyn Envelope) -> Option<u64> + Send + Sync>;
