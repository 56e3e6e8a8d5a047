//! 공통 에러 타입.

use thiserror::Error;

/// 설정 로드와 로깅 초기화 과정의 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 설정 값 검증 실패
    #[error("설정 에러: {0}")]
    Config(String),

    /// 설정 파일/환경 변수 로드 실패
    #[error("설정 로드 에러: {0}")]
    Load(#[from] config::ConfigError),

    /// 로깅 초기화 실패
    #[error("로깅 초기화 에러: {0}")]
    Logging(String),
}
