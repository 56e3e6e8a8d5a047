//! REST/스트림 요청 흐름 제어.
//!
//! - [`bucket`]: 토큰 버킷 한도기
//! - [`semaphore`]: 동시 요청 수 제한
//! - [`gate`]: 세마포어 + 전역 버킷 + 라우트별 버킷을 합성한 요청 게이트
//! - [`quota`]: 서버 보고 쿼터에 따른 라우트 한도기 재설정

pub mod bucket;
pub mod gate;
pub mod quota;
pub mod semaphore;

pub use bucket::TokenBucket;
pub use gate::{GatePermit, GateStats, RequestGate, RouteKey, STREAM_OP_METHOD};
pub use quota::{
    EffectiveQuota, QuotaReport, QuotaSync, ACCOUNT_RATE_LIMIT_PATH, ORDER_QUOTA_WINDOW,
};
pub use semaphore::AdmissionSemaphore;
