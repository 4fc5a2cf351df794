//! 인바운드 서버 통합 테스트
//!
//! 실제 TCP/WS 클라이언트로 에코, WebSocket 업그레이드, 우아한 종료를
//! 검증합니다.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use netcore::codec::{BinCodec, BinEnvelope, HEADER_LEN};
use netcore::config::ServerTcpConfig;
use netcore::dispatch::Dispatcher;
use netcore::message::{Envelope, Message};
use netcore::server::{InboundServer, ServerHooks};
use netcore::ws;
use netcore::InboundClient;

/// 바이트 그대로 나르는 테스트 페이로드 타입
macro_rules! raw_msg {
    ($name:ident, $id:literal) => {
        struct $name(Vec<u8>);

        impl Message for $name {
            fn message_id() -> &'static str {
                $id
            }
            fn decode(buf: &[u8]) -> Result<Self> {
                Ok(Self(buf.to_vec()))
            }
            fn encode(&self) -> Result<Vec<u8>> {
                Ok(self.0.clone())
            }
        }
    };
}

raw_msg!(Echo42, "42");
raw_msg!(Text7, "7");
raw_msg!(Slow55, "55");

#[derive(Default)]
struct CountingHooks {
    connected: AtomicUsize,
    handshakes: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl ServerHooks for CountingHooks {
    async fn on_connected(&self, _client: &Arc<InboundClient>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }
    async fn on_ws_handshake(&self, _client: &Arc<InboundClient>) {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
    }
    async fn on_disconnect(
        &self,
        _client: &Arc<InboundClient>,
        _err: Option<shared::NetError>,
    ) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

fn envelope_bytes(id: u32, body: &[u8]) -> Vec<u8> {
    BinEnvelope::new(id, body.to_vec()).encode().unwrap()
}

/// 응답 봉투 하나를 소켓에서 읽는다
async fn read_envelope(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    (id, body)
}

/// 에코 라운드트립: 보낸 봉투가 500ms 안에 그대로 돌아와야 하고,
/// 그 전에 on_connected가 정확히 1회 호출되어야 한다
#[tokio::test]
async fn test_echo_over_raw_tcp() {
    let dispatcher = Arc::new(Dispatcher::default());
    dispatcher.req_resp::<Echo42, Echo42, _, _>(|_conn, req| async move { Ok(req) });

    let hooks = Arc::new(CountingHooks::default());
    let server = InboundServer::new(
        "127.0.0.1:17101",
        ServerTcpConfig::default(),
        dispatcher,
        Arc::new(BinCodec),
        hooks.clone(),
    );
    server.start().await.unwrap();

    let mut client = TcpStream::connect("127.0.0.1:17101").await.unwrap();
    client
        .write_all(&envelope_bytes(42, b"hello"))
        .await
        .unwrap();

    let (id, body) = tokio::time::timeout(Duration::from_millis(500), read_envelope(&mut client))
        .await
        .expect("에코 응답은 500ms 안에 도착해야 함");
    assert_eq!(id, 42);
    assert_eq!(body, b"hello");
    assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);

    drop(client);
    server.stop().await;
}

/// 한 연결로 여러 봉투를 이어 보내도 순서대로 모두 응답받아야 한다
#[tokio::test]
async fn test_pipelined_envelopes_in_order() {
    let dispatcher = Arc::new(Dispatcher::default());
    dispatcher.req_resp::<Echo42, Echo42, _, _>(|_conn, req| async move { Ok(req) });

    let server = InboundServer::new(
        "127.0.0.1:0",
        ServerTcpConfig::default(),
        dispatcher,
        Arc::new(BinCodec),
        Arc::new(CountingHooks::default()),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut batch = Vec::new();
    for i in 0..20u32 {
        batch.extend(envelope_bytes(42, format!("m{}", i).as_bytes()));
    }
    client.write_all(&batch).await.unwrap();

    for i in 0..20u32 {
        let (id, body) =
            tokio::time::timeout(Duration::from_secs(2), read_envelope(&mut client))
                .await
                .unwrap();
        assert_eq!(id, 42);
        assert_eq!(body, format!("m{}", i).as_bytes());
    }

    drop(client);
    server.stop().await;
}

/// ClientId 인덱스: add_client 후 id로 전송, remove 후 조회 실패
#[tokio::test]
async fn test_client_id_index_send() {
    let dispatcher = Arc::new(Dispatcher::default());
    let server = InboundServer::new(
        "127.0.0.1:0",
        ServerTcpConfig::default(),
        dispatcher,
        Arc::new(BinCodec),
        Arc::new(CountingHooks::default()),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.count(), 1);

    // 유일한 연결을 user-77로 등록
    let mut found = None;
    server.range_clients(|c| {
        found = Some(c.clone());
        true
    });
    server.add_client("user-77", found.unwrap());
    assert!(server.get_client("user-77").is_some());

    server
        .send_msg("user-77", &BinEnvelope::new(9, b"push".to_vec()))
        .await
        .unwrap();
    let (id, body) = tokio::time::timeout(Duration::from_secs(1), read_envelope(&mut client))
        .await
        .unwrap();
    assert_eq!(id, 9);
    assert_eq!(body, b"push");

    assert!(server.remove_client("user-77").is_some());
    assert!(server.get_client("user-77").is_none());
    // 연결 자체는 살아 있어야 함
    assert_eq!(server.count(), 1);

    drop(client);
    server.stop().await;
}

/// WS 업그레이드 + 텍스트 에코: 업그레이드 응답에 서버 핑거프린트가
/// 있어야 하고 텍스트 프레임 "abc"는 텍스트 프레임으로 돌아와야 한다
#[tokio::test]
async fn test_websocket_upgrade_and_text_echo() {
    let dispatcher = Arc::new(Dispatcher::default());
    // 텍스트 프레임은 id 7 봉투로 들어온다: 그대로 텍스트로 응답
    dispatcher.req_resp::<Text7, Text7, _, _>(|_conn, req| async move { Ok(req) });

    let cfg = ServerTcpConfig {
        websocket: true,
        ws_text_msg_id: 7,
        ..Default::default()
    };
    let hooks = Arc::new(CountingHooks::default());
    let server = InboundServer::new(
        "127.0.0.1:17301",
        cfg,
        dispatcher,
        Arc::new(BinCodec),
        hooks.clone(),
    );
    server.start().await.unwrap();

    let mut client = TcpStream::connect("127.0.0.1:17301").await.unwrap();
    client
        .write_all(
            b"GET /game HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    // 101 응답 수신 (헤더 끝까지)
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        response.push(byte[0]);
        assert!(response.len() < 4096, "업그레이드 응답이 너무 큼");
    }
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert!(response.contains("X-Server-Fingerprint: netcore/"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hooks.handshakes.load(Ordering::SeqCst), 1);

    // 텍스트 프레임 "abc" 전송
    let frame = ws::encode_client_frame(ws::opcode::TEXT, b"abc", [0x11, 0x22, 0x33, 0x44]);
    client.write_all(&frame).await.unwrap();

    // 텍스트 프레임 응답: FIN+TEXT, 마스킹 없음, 페이로드 "abc"
    let mut head = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(1), client.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head[0], 0x81, "FIN + 텍스트 opcode");
    assert_eq!(head[1] as usize, 3, "서버 프레임은 마스킹 없이 길이 3");
    let mut payload = [0u8; 3];
    client.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"abc");

    // ping -> pong 자동 응답
    let ping = ws::encode_client_frame(ws::opcode::PING, b"hb", [1, 2, 3, 4]);
    client.write_all(&ping).await.unwrap();
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x80 | ws::opcode::PONG);
    let mut payload = vec![0u8; head[1] as usize];
    client.read_exact(&mut payload).await.unwrap();
    assert_eq!(payload, b"hb");

    drop(client);
    server.stop().await;
}

/// 우아한 종료 드레인: 200ms 걸리는 핸들러 10건이 wait_all_done(2s)
/// 안에 모두 끝나야 한다
#[tokio::test]
async fn test_wait_all_done_drains_handlers() {
    let done = Arc::new(AtomicUsize::new(0));
    let done_ref = done.clone();

    let dispatcher = Arc::new(Dispatcher::default());
    dispatcher.one_way::<Slow55, _, _>(move |_conn, _msg| {
        let done = done_ref.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    // 병렬 드레인을 위해 연결별 순차 실행은 끈다
    let cfg = ServerTcpConfig {
        msg_seq: false,
        ..Default::default()
    };
    let server = InboundServer::new(
        "127.0.0.1:0",
        cfg,
        dispatcher,
        Arc::new(BinCodec),
        Arc::new(CountingHooks::default()),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut batch = Vec::new();
    for _ in 0..10 {
        batch.extend(envelope_bytes(55, b"work"));
    }
    client.write_all(&batch).await.unwrap();

    // 디스패치 시작을 기다린 뒤 드레인
    tokio::time::sleep(Duration::from_millis(100)).await;
    let start = tokio::time::Instant::now();
    assert!(server.wait_all_done(Duration::from_secs(2)).await);
    assert!(start.elapsed() <= Duration::from_secs(2));
    assert_eq!(done.load(Ordering::SeqCst), 10);

    drop(client);
    server.stop().await;
}

/// 유휴 타임아웃: activeTimeoutSec을 넘긴 연결은 서버가 정리한다
#[tokio::test]
async fn test_active_timeout_closes_idle_conn() {
    let cfg = ServerTcpConfig {
        active_timeout_sec: 1,
        tick_interval_sec: 0.2,
        ..Default::default()
    };
    let hooks = Arc::new(CountingHooks::default());
    let server = InboundServer::new(
        "127.0.0.1:0",
        cfg,
        Arc::new(Dispatcher::default()),
        Arc::new(BinCodec),
        hooks.clone(),
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.count(), 1);

    // 아무것도 보내지 않고 대기하면 서버가 연결을 정리해야 함
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(server.count(), 0);
    assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);

    drop(client);
    server.stop().await;
}
