//! 프레임 TCP 연결
//!
//! 양방향 TCP 바이트 스트림의 읽기/쓰기 루프와 생명주기를 관리합니다.
//! dial 모드(원격 주소로 접속, 무한 재시도)와 accept 모드(수락된
//! 소켓 래핑, 재연결 없음)를 모두 지원합니다.
//!
//! # 생명주기 (dial 모드)
//!
//! ```text
//! Invalid -> Connecting -> (접속 성공) Connected -> (rw 종료) RwExit
//!    ^           |(실패)                                 |
//!    |           v                                       v
//!    +---- 1초 백오프 <------- Invalid <------- Stopping (종료 상태)
//! ```
//!
//! 상태는 드라이버 태스크만 변경하며, 다른 관찰자는 원자적으로 읽습니다.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shared::{CurrentTime, NetError};

/// 전송 큐 용량
pub const WRITE_QUEUE_CAP: usize = 10_000;

/// 전송 큐 적체 타임아웃
pub const SEND_TIMEOUT: Duration = Duration::from_secs(4);

/// 읽기 데드라인 (협조적 취소 체크포인트 간격)
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// 재시도/재연결 백오프
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

const READ_BUF_INIT: usize = 16 * 1024;

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Invalid = 0,
    Connecting = 1,
    Connected = 2,
    Stopping = 3,
    RwExit = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Stopping,
            4 => ConnState::RwExit,
            _ => ConnState::Invalid,
        }
    }
}

/// 연결 이벤트 싱크
///
/// 모든 콜백은 연결의 드라이버 태스크에서 호출됩니다. 콜백 안에서
/// `close(true)`를 호출하면 자기 자신을 기다리는 데드락이 되므로
/// 콜백 내부에서는 반드시 `close(false)`를 사용해야 합니다.
#[async_trait]
pub trait ConnEvents: Send + Sync + 'static {
    /// dial 실패. `Some(err)` 반환 시 영구 종료, `None`이면 1초 후 재시도.
    async fn on_dial_fail(&self, err: NetError) -> Option<NetError> {
        let _ = err;
        None
    }

    /// TCP 접속 직후 호출.
    async fn on_dial_success(&self) {}

    /// 연결이 끊어질 때 호출. `Some(err)` 반환 시 자동 재연결 금지.
    /// 전송 큐가 폐기되기 전에 호출됩니다.
    async fn on_disconnect(&self, err: Option<NetError>) -> Option<NetError> {
        let _ = err;
        None
    }

    /// 수신 버퍼 소비. 소비한 바이트 수를 반환하며, 0이면 더 채울 때까지
    /// 대기합니다. 에러는 프로토콜 위반으로 연결이 종료됩니다.
    async fn on_recv(&self, buf: &[u8]) -> Result<usize>;

    /// 전송 직전 마지막 변형 훅.
    async fn on_send(&self, buf: Vec<u8>) -> Result<Vec<u8>> {
        Ok(buf)
    }
}

enum Mode {
    Dial { addr: String },
    Accept,
}

/// 프레임 TCP 연결
pub struct FramedConn {
    name: String,
    mode: Mode,
    state: AtomicU8,
    write_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    stop_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    reconnect_nudge: Notify,
    last_activity_ms: AtomicI64,
    pending_stream: Mutex<Option<TcpStream>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    peer_addr: RwLock<Option<String>>,
}

impl FramedConn {
    /// dial 모드 연결 생성. `start`를 호출해야 접속을 시작합니다.
    pub fn dial(name: impl Into<String>, addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new_inner(name.into(), Mode::Dial { addr: addr.into() }, None))
    }

    /// accept 모드 연결 생성. `start` 호출 시 Connected 상태로 진입합니다.
    pub fn accepted(name: impl Into<String>, stream: TcpStream) -> Arc<Self> {
        let peer = stream.peer_addr().map(|a| a.to_string()).ok();
        let conn = Self::new_inner(name.into(), Mode::Accept, Some(stream));
        *conn.peer_addr.write() = peer;
        Arc::new(conn)
    }

    fn new_inner(name: String, mode: Mode, stream: Option<TcpStream>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        Self {
            name,
            mode,
            state: AtomicU8::new(ConnState::Invalid as u8),
            write_tx: RwLock::new(None),
            stop_tx,
            closed_tx,
            reconnect_nudge: Notify::new(),
            last_activity_ms: AtomicI64::new(CurrentTime::now_millis()),
            pending_stream: Mutex::new(stream),
            driver: Mutex::new(None),
            started: AtomicBool::new(false),
            peer_addr: RwLock::new(None),
        }
    }

    /// 드라이버 태스크 시작
    pub fn start(self: &Arc<Self>, events: Arc<dyn ConnEvents>) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("이미 시작된 연결: {}", self.name);
            return;
        }
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            conn.drive(events).await;
        });
        *self.driver.lock() = Some(handle);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 소켓 기준 원격 주소
    pub fn peer_addr(&self) -> Option<String> {
        self.peer_addr.read().clone()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// 마지막 수신 활동 시각 (epoch millis)
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(CurrentTime::now_millis(), Ordering::Release);
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// 바이트 전송. 큐가 가득 차면 최대 4초 대기 후 `SendTimeout`.
    pub async fn send(&self, buf: Vec<u8>) -> Result<()> {
        let tx = self
            .write_tx
            .read()
            .clone()
            .ok_or_else(|| NetError::NotConnected(self.name.clone()))?;
        match tx.send_timeout(buf, SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(NetError::SendTimeout.into()),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(NetError::SendQueueClosed.into())
            }
        }
    }

    /// 종료 신호만 보냅니다 (대기 없음). 동기 문맥에서 사용 가능.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        if !self.started.load(Ordering::Acquire) {
            let _ = self.closed_tx.send(true);
        }
    }

    /// 연결 종료.
    ///
    /// `wait=true`면 드라이버가 완전히 종료(on_disconnect 포함)될 때까지
    /// 블록합니다. 이벤트 콜백 안에서는 반드시 `wait=false`를 사용하세요.
    pub async fn close(&self, wait: bool) {
        self.shutdown();
        if wait && self.started.load(Ordering::Acquire) {
            self.wait_closed().await;
        }
    }

    /// 드라이버 종료 대기
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 현재 연결을 끊고 1초 백오프 후 재접속합니다. dial 모드 전용.
    pub fn reconnect(&self) {
        if !matches!(self.mode, Mode::Dial { .. }) {
            return;
        }
        if self.is_connected() {
            self.reconnect_nudge.notify_waiters();
        }
    }

    async fn drive(self: Arc<Self>, events: Arc<dyn ConnEvents>) {
        let mut stop_rx = self.stop_tx.subscribe();
        match &self.mode {
            Mode::Accept => {
                let stream = self.pending_stream.lock().take();
                if let Some(stream) = stream {
                    self.set_state(ConnState::Connected);
                    let (reason, writer) = self.run_rw(stream, &events, &mut stop_rx).await;
                    self.set_state(ConnState::RwExit);
                    let _ = events.on_disconnect(reason).await;
                    self.discard_queue(writer);
                }
            }
            Mode::Dial { addr } => {
                let addr = addr.clone();
                loop {
                    if *stop_rx.borrow() {
                        break;
                    }
                    self.set_state(ConnState::Connecting);
                    match TcpStream::connect(&addr).await {
                        Err(e) => {
                            let err = NetError::DialFailed(format!("{}: {}", addr, e));
                            if let Some(fatal) = events.on_dial_fail(err).await {
                                debug!("다이얼 영구 중단: {} ({})", self.name, fatal);
                                break;
                            }
                            self.set_state(ConnState::Invalid);
                            if self.backoff(&mut stop_rx).await {
                                break;
                            }
                        }
                        Ok(stream) => {
                            *self.peer_addr.write() =
                                stream.peer_addr().map(|a| a.to_string()).ok();
                            self.set_state(ConnState::Connected);
                            events.on_dial_success().await;
                            let (reason, writer) =
                                self.run_rw(stream, &events, &mut stop_rx).await;
                            self.set_state(ConnState::RwExit);
                            let veto = events.on_disconnect(reason).await;
                            self.discard_queue(writer);
                            if veto.is_some() || *stop_rx.borrow() {
                                break;
                            }
                            self.set_state(ConnState::Invalid);
                            if self.backoff(&mut stop_rx).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.set_state(ConnState::Stopping);
        let _ = self.closed_tx.send(true);
        debug!("연결 드라이버 종료: {}", self.name);
    }

    /// 읽기/쓰기 루프. 종료 사유와 쓰기 태스크 핸들을 반환합니다.
    ///
    /// 전송 큐 폐기는 on_disconnect 이후 호출자가 수행합니다.
    async fn run_rw(
        &self,
        stream: TcpStream,
        events: &Arc<dyn ConnEvents>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> (Option<NetError>, JoinHandle<Option<NetError>>) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_CAP);
        *self.write_tx.write() = Some(tx);
        self.touch();

        let w_events = events.clone();
        let mut writer: JoinHandle<Option<NetError>> = tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                let buf = match w_events.on_send(buf).await {
                    Ok(b) => b,
                    Err(e) => {
                        // 인코딩 실패는 해당 버퍼만 버리고 연결은 유지
                        warn!("onSend 훅 실패, 버퍼 폐기: {:#}", e);
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&buf).await {
                    return Some(NetError::NotConnected(format!("write: {}", e)));
                }
            }
            None
        });

        let mut rbuf = BytesMut::with_capacity(READ_BUF_INIT);
        let reason: Option<NetError> = loop {
            tokio::select! {
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break None;
                    }
                }
                _ = self.reconnect_nudge.notified() => {
                    debug!("재연결 요청으로 rw 루프 종료: {}", self.name);
                    break Some(NetError::NotConnected("reconnect requested".into()));
                }
                res = &mut writer => {
                    let err = res.ok().flatten();
                    break Some(err.unwrap_or_else(|| {
                        NetError::NotConnected("write loop exited".into())
                    }));
                }
                res = tokio::time::timeout(READ_DEADLINE, read_half.read_buf(&mut rbuf)) => {
                    match res {
                        // 데드라인 경과: 정지 신호 확인을 위한 체크포인트
                        Err(_) => continue,
                        Ok(Ok(0)) => break Some(NetError::NotConnected("peer closed".into())),
                        Ok(Ok(_)) => {
                            self.touch();
                            if let Err(e) = self.consume(&mut rbuf, events).await {
                                break Some(e);
                            }
                        }
                        Ok(Err(e)) => {
                            break Some(NetError::NotConnected(format!("read: {}", e)));
                        }
                    }
                }
            }
        };

        (reason, writer)
    }

    /// 전송 큐 폐기: 적체 중이던 쓰기는 버려집니다.
    fn discard_queue(&self, writer: JoinHandle<Option<NetError>>) {
        *self.write_tx.write() = None;
        writer.abort();
    }

    /// 누적 버퍼를 on_recv로 반복 소비
    async fn consume(
        &self,
        rbuf: &mut BytesMut,
        events: &Arc<dyn ConnEvents>,
    ) -> Result<(), NetError> {
        loop {
            if rbuf.is_empty() {
                return Ok(());
            }
            let consumed = match AssertUnwindSafe(events.on_recv(&rbuf[..]))
                .catch_unwind()
                .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(NetError::Protocol(format!("recv consumer: {:#}", e)));
                }
                Err(panic) => {
                    let msg = panic_message(&panic);
                    shared::alert_error!("Panic in recv consumer [{}]: {}", self.name, msg);
                    return Err(NetError::Protocol(format!("panic: {}", msg)));
                }
            };
            if consumed == 0 {
                return Ok(());
            }
            if consumed > rbuf.len() {
                return Err(NetError::Protocol(format!(
                    "소비 길이가 버퍼를 초과: {} > {}",
                    consumed,
                    rbuf.len()
                )));
            }
            rbuf.advance(consumed);
        }
    }

    /// 1초 백오프. 반환 true = 중단 요청 수신.
    async fn backoff(&self, stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => false,
            res = stop_rx.changed() => res.is_err() || *stop_rx.borrow(),
        }
    }
}

/// 패닉 페이로드에서 메시지 추출
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingEvents {
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl ConnEvents for CountingEvents {
        async fn on_recv(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        async fn on_disconnect(&self, _err: Option<NetError>) -> Option<NetError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            // 재연결 금지
            Some(NetError::Stopped)
        }
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let conn = FramedConn::dial("test", "127.0.0.1:1");
        let err = conn.send(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetError>(),
            Some(NetError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_close_unstarted_conn_returns() {
        let conn = FramedConn::dial("test", "127.0.0.1:1");
        // 시작 전 close는 바로 반환되어야 함
        conn.close(true).await;
        assert_eq!(conn.state(), ConnState::Invalid);
    }

    /// accept 모드: 상대가 끊으면 on_disconnect가 정확히 1회 호출되고
    /// close(wait=true)가 반환되어야 함
    #[tokio::test]
    async fn test_accept_mode_disconnect_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let events = Arc::new(CountingEvents {
            disconnects: AtomicUsize::new(0),
        });
        let conn = FramedConn::accepted("test-accept", server_side);
        conn.start(events.clone());

        // 접속 직후 Connected 상태
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.is_connected());

        drop(client);
        conn.wait_closed().await;
        assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnState::Stopping);
    }

    /// dial 모드: 접속 실패 시 on_dial_fail 거부로 영구 종료
    #[tokio::test]
    async fn test_dial_fail_veto_terminates() {
        struct VetoEvents;

        #[async_trait]
        impl ConnEvents for VetoEvents {
            async fn on_dial_fail(&self, err: NetError) -> Option<NetError> {
                Some(err)
            }
            async fn on_recv(&self, buf: &[u8]) -> Result<usize> {
                Ok(buf.len())
            }
        }

        // 닫힌 포트로 다이얼
        let conn = FramedConn::dial("test-dial", "127.0.0.1:1");
        conn.start(Arc::new(VetoEvents));
        conn.wait_closed().await;
        assert_eq!(conn.state(), ConnState::Stopping);
    }
}
