//! 네트워크 코어 라이브러리
//!
//! 클러스터 게임 서버의 연결 엔진입니다.
//!
//! # 주요 기능
//!
//! - **프레임 TCP 연결**: dial/accept 모드, 전송 큐 배압, 재연결 상태 기계
//! - **WebSocket 어댑터**: 수락 연결의 RFC 6455 업그레이드와 프레임 변환
//! - **인바운드 서버**: 연결 인덱스, ClientId 인덱스, 틱 스케줄러
//! - **메시지 디스패치**: 메시지 id 기반 타입 핸들러, 서킷 브레이커 게이트
//! - **RPC 상관**: rpcId 대기자 테이블과 응답/종료/타임아웃 의미
//! - **순차 실행기**: 연결별 FIFO 실행 보장
//!
//! # 아키텍처
//!
//! ```text
//! Listener -> FramedConn -> (WsSession) -> Pipeline
//!                                            ├── RpcTable (응답 분리)
//!                                            └── Dispatcher -> Sequencer -> 핸들러
//! ```
//!
//! # 모듈 구조
//!
//! - **conn**: 프레임 TCP 연결 (C1)
//! - **ws**: WebSocket 어댑터
//! - **listener**: TCP 리슨 소켓 래퍼
//! - **server / client**: 인바운드 서버와 수락 연결
//! - **sequencer**: 연결별 FIFO 실행기
//! - **dispatch**: 메시지 디스패처
//! - **rpc**: RPC 대기자 테이블
//! - **pipeline**: 공통 수신 경로
//! - **message / codec**: 메시지 계약과 기본 바이너리 코덱
//! - **config**: 서버/디스패치 설정

/// 프레임 TCP 연결
pub mod conn;

/// WebSocket 어댑터
pub mod ws;

/// TCP 리스너
pub mod listener;

/// 인바운드 서버
pub mod server;

/// 수락된 클라이언트 연결
pub mod client;

/// 연결별 순차 실행기
pub mod sequencer;

/// 메시지 디스패처
pub mod dispatch;

/// RPC 요청/응답 상관
pub mod rpc;

/// 공통 수신 파이프라인
pub mod pipeline;

/// 메시지 계약
pub mod message;

/// 기본 바이너리 봉투 코덱
pub mod codec;

/// 설정 타입
pub mod config;

// 주요 타입 재수출
pub use client::InboundClient;
pub use codec::{BinCodec, BinEnvelope};
pub use config::{DispatchConfig, ServerTcpConfig};
pub use conn::{ConnEvents, ConnState, FramedConn};
pub use dispatch::{Dispatcher, HandlerKind};
pub use listener::TcpServerListener;
pub use message::{ConnRef, Envelope, EnvelopeCodec, Message, RpcRespCheck, Sender};
pub use pipeline::Pipeline;
pub use rpc::RpcTable;
pub use sequencer::Sequencer;
pub use server::{InboundServer, NoopHooks, ServerHooks};
pub use ws::WsSession;
