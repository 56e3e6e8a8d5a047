//! 스트리밍 연결 관리.
//!
//! - [`session`]: 연결 수명 상태 머신과 제어 루프
//! - [`reconcile`]: 희망 구독 집합과 연결별 구독 상태 재조정
//! - [`correlator`]: 오퍼레이션 요청/응답 상관
//! - [`dispatch`]: 읽기 루프와 소비자를 분리하는 제한 용량 큐
//! - [`frame`]: 프레임 인코딩/분류
//! - [`stats`]: 관측용 스냅샷

pub mod correlator;
pub mod dispatch;
pub mod frame;
pub mod reconcile;
pub mod session;
pub mod state;
pub mod stats;

pub use correlator::{OpCorrelator, OpWaiter};
pub use dispatch::DispatchQueue;
pub use frame::{DataMessage, InboundFrame, OpReply, RawMessage, SubscriptionOp, Topic};
pub use reconcile::{LiveStatus, LiveSubscriptions};
pub use session::StreamSession;
pub use state::{Backoff, SessionState};
pub use stats::{LastError, QueueStats, SessionCounters, SessionStats};
