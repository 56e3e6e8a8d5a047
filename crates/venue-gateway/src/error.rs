//! 게이트웨이 에러 타입.

use thiserror::Error;

/// 게이트웨이 작업을 위한 Result 타입.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// 게이트웨이 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// 호출자가 취소함 (토큰 취소, 세션 종료 중 대기 해제)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// 세션 또는 큐가 종료됨
    #[error("Stopped")]
    Stopped,

    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    Network(String),

    /// 연결 끊김 (대기 중이던 오퍼레이션에 전달됨)
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 세션이 아직 Ready 상태가 아님
    #[error("Not ready: {0}")]
    NotReady(String),

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 인증 실패
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 프로토콜 위반 (예상하지 못한 프레임)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 타임아웃 (연결, 인증, 활성 감시)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 스트림 오퍼레이션 실패 응답
    #[error("Op {op} failed with code {code}: {message}")]
    Op {
        op: String,
        code: String,
        message: String,
    },

    /// REST API 에러 코드
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    /// 서버가 보고한 쿼터 값을 해석할 수 없음
    #[error("Quota error: {0}")]
    Quota(String),

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    Parse(String),

    /// 잘못된 설정
    #[error("Config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// 취소 계열 에러인지 확인.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, GatewayError::Cancelled(_) | GatewayError::Stopped)
    }

    /// 연결 계층 에러인지 확인 (세션이 재연결로 복구함).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_)
                | GatewayError::Disconnected(_)
                | GatewayError::WebSocket(_)
                | GatewayError::Unauthorized(_)
                | GatewayError::Protocol(_)
                | GatewayError::Timeout(_)
        )
    }

    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_)
                | GatewayError::Disconnected(_)
                | GatewayError::NotReady(_)
                | GatewayError::WebSocket(_)
                | GatewayError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_decode() {
            GatewayError::Parse(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GatewayError::Cancelled("ctx".to_string()).is_cancellation());
        assert!(GatewayError::Stopped.is_cancellation());
        assert!(!GatewayError::Disconnected("x".to_string()).is_cancellation());

        assert!(GatewayError::Unauthorized("bad sign".to_string()).is_connection_error());
        assert!(!GatewayError::Unauthorized("bad sign".to_string()).is_retryable());
        assert!(GatewayError::Timeout("liveness".to_string()).is_retryable());

        let op = GatewayError::Op {
            op: "order".to_string(),
            code: "51008".to_string(),
            message: "insufficient balance".to_string(),
        };
        assert!(!op.is_retryable());
        assert!(!op.is_connection_error());
    }
}
