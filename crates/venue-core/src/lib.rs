//! # Venue Core
//!
//! 게이트웨이 크레이트들이 공유하는 기반 코드를 제공합니다:
//! - 설정 모델 및 로더 (파일 + 환경 변수)
//! - tracing 기반 로깅 초기화
//! - 공통 에러 타입

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::*;
pub use logging::*;
