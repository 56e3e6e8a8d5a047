//! # Venue Gateway
//!
//! 거래소 REST/WebSocket 클라이언트를 위한 연결 관리 및 흐름 제어.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 요청 게이트: 동시성 제한 + 전역/라우트별 토큰 버킷
//! - 서버 보고 쿼터에 따른 라우트 한도기 재설정 (fail-closed)
//! - 스트리밍 세션: 재연결, 백오프, 활성 감시, 로그인, 재구독
//! - 스트림 오퍼레이션 요청/응답 상관
//! - 읽기 루프와 소비자를 분리하는 제한 용량 분배 큐
//! - 게이트를 거치는 REST 클라이언트와 서명 경계

pub mod auth;
pub mod error;
pub mod ratelimit;
pub mod rest;
pub mod stream;

pub use auth::{Authenticator, HmacCredentials, RequestSigner};
pub use error::{GatewayError, GatewayResult};
pub use ratelimit::{
    AdmissionSemaphore, EffectiveQuota, GatePermit, GateStats, QuotaReport, QuotaSync,
    RequestGate, RouteKey, TokenBucket,
};
pub use rest::RestClient;
pub use stream::{
    DataMessage, DispatchQueue, OpReply, RawMessage, SessionState, SessionStats, StreamSession,
    Topic,
};
