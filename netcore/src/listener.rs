//! TCP 리스너
//!
//! 리슨 소켓의 얇은 래퍼입니다. SO_REUSEADDR 옵션, accept 에러에 대한
//! 지수 백오프(5ms -> 1s), 종료 훅을 제공합니다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// accept 에러 백오프 시작/상한
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub type AcceptCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;
pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// TCP 리슨 소켓 래퍼
pub struct TcpServerListener {
    addr: String,
    reuse_addr: bool,
    stop_tx: watch::Sender<bool>,
    local_addr: RwLock<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServerListener {
    pub fn new(addr: impl Into<String>, reuse_addr: bool) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            reuse_addr,
            stop_tx,
            local_addr: RwLock::new(None),
            handle: Mutex::new(None),
        }
    }

    /// 바인드 후 실제 리슨 주소
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// 바인드하고 accept 루프를 시작합니다.
    pub async fn start(
        &self,
        on_accept: AcceptCallback,
        on_shutdown: ShutdownCallback,
    ) -> Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("리슨 주소 파싱 실패: {}", self.addr))?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("리슨 소켓 생성 실패")?;
        if self.reuse_addr {
            socket
                .set_reuse_address(true)
                .context("SO_REUSEADDR 설정 실패")?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("바인드 실패: {}", addr))?;
        socket.listen(1024).context("listen 실패")?;

        let listener = TcpListener::from_std(socket.into()).context("리스너 변환 실패")?;
        let local = listener.local_addr()?;
        *self.local_addr.write() = Some(local);
        info!("TCP 리슨 시작: {} (reuse_addr={})", local, self.reuse_addr);

        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut backoff = ACCEPT_BACKOFF_MIN;
            loop {
                tokio::select! {
                    res = stop_rx.changed() => {
                        if res.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                backoff = ACCEPT_BACKOFF_MIN;
                                debug!("연결 수락: {}", peer);
                                on_accept(stream, peer);
                            }
                            Err(e) => {
                                // 일시적 accept 실패가 루프를 돌며 CPU를 태우지 않게 백오프
                                warn!("accept 실패: {} ({}ms 대기)", e, backoff.as_millis());
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                            }
                        }
                    }
                }
            }
            info!("TCP 리슨 종료: {}", local);
            on_shutdown();
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// accept 루프를 멈추고 종료를 기다립니다.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
