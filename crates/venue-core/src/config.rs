//! 게이트웨이 설정 관리.
//!
//! REST 요청 게이트, 스트리밍 세션, 로깅 설정을 정의하고
//! 파일과 환경 변수에서 로드합니다.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CoreError;
use crate::logging::LogFormat;

/// 게이트웨이 전체 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// REST 클라이언트 설정
    #[serde(default)]
    pub rest: RestConfig,
    /// 요청 한도 설정
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 스트리밍 연결 설정
    #[serde(default)]
    pub stream: StreamConfig,
    /// 로깅 설정
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 환경 변수는 `VENUE__RATE_LIMIT__MAX_CONCURRENT=4` 형식으로 파일 값을 덮어씁니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("VENUE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, CoreError> {
        Self::load("config/default.toml")
    }

    /// 설정 값의 일관성을 검사합니다.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.rate_limit.validate()?;
        self.stream.validate()?;
        if self.rest.timeout_secs == 0 {
            return Err(CoreError::Config("rest.timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// REST 클라이언트 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestConfig {
    /// REST API 기본 URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 요청 타임아웃 (초)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://www.okx.com".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RestConfig {
    /// 요청 타임아웃 Duration 반환.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 라우트 단위 요청 한도 재정의.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteLimitConfig {
    /// HTTP 메서드 (스트림 오퍼레이션은 "WS")
    pub method: String,
    /// 요청 경로 또는 오퍼레이션 이름
    pub endpoint: String,
    /// 초당 허용 요청 수
    pub rps: f64,
    /// 버스트 용량
    pub burst: f64,
}

/// REST 요청 게이트 설정.
///
/// 기본값(동시성 10, 10 RPS, 버스트 20)은 안전망으로 두는 하한선이며
/// 운영 환경에 맞춰 조정된 값이 아닙니다.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// 게이트 활성화 여부
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 동시 요청 최대 수 (0이면 제한 없음)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 전역 초당 요청 수 (0 이하면 전역 버킷 없음)
    #[serde(default = "default_global_rps")]
    pub global_rps: f64,
    /// 전역 버스트 용량
    #[serde(default = "default_global_burst")]
    pub global_burst: f64,
    /// 라우트별 재정의
    #[serde(default)]
    pub routes: Vec<RouteLimitConfig>,
}

fn default_enabled() -> bool {
    true
}
fn default_max_concurrent() -> usize {
    10
}
fn default_global_rps() -> f64 {
    10.0
}
fn default_global_burst() -> f64 {
    20.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_concurrent: default_max_concurrent(),
            global_rps: default_global_rps(),
            global_burst: default_global_burst(),
            routes: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// 게이트를 완전히 끈 설정.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// 라우트 재정의 추가.
    pub fn with_route(
        mut self,
        method: impl Into<String>,
        endpoint: impl Into<String>,
        rps: f64,
        burst: f64,
    ) -> Self {
        self.routes.push(RouteLimitConfig {
            method: method.into(),
            endpoint: endpoint.into(),
            rps,
            burst,
        });
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.global_rps.is_finite() || !self.global_burst.is_finite() {
            return Err(CoreError::Config(
                "rate_limit.global_rps/global_burst must be finite".to_string(),
            ));
        }
        for route in &self.routes {
            if route.endpoint.is_empty() || route.method.is_empty() {
                return Err(CoreError::Config(
                    "rate_limit.routes entries need a method and an endpoint".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// 분배 큐가 가득 찼을 때의 처리 방식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflow {
    /// 가장 오래된 메시지를 버리고 새 메시지를 넣음
    #[default]
    DropOldest,
    /// 새 메시지를 버림
    DropNewest,
}

/// 스트리밍 세션 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// WebSocket URL
    #[serde(default = "default_ws_url")]
    pub url: String,
    /// 로그인 필요 여부 (private 채널)
    #[serde(default)]
    pub requires_login: bool,
    /// 재연결 최소 대기 시간 (밀리초)
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    /// 재연결 최대 대기 시간 (밀리초)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 재연결 대기 시간에 더하는 무작위 지터 상한 (밀리초)
    #[serde(default)]
    pub backoff_jitter_ms: u64,
    /// 수신/하트비트가 없을 때 연결을 끊기까지의 시간 (밀리초)
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// ping 전송 간격 (밀리초)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// 로그인 응답 대기 시간 (밀리초)
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// 연결 시도 타임아웃 (밀리초)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// 파싱된 메시지 큐 용량
    #[serde(default = "default_queue_capacity")]
    pub typed_queue_capacity: usize,
    /// 원본 메시지 큐 용량 (0이면 원본 전달 비활성화)
    #[serde(default = "default_queue_capacity")]
    pub raw_queue_capacity: usize,
    /// 구독 프레임 하나에 담는 최대 토픽 수
    #[serde(default = "default_max_topics_per_frame")]
    pub max_topics_per_frame: usize,
    /// 큐 오버플로 정책
    #[serde(default)]
    pub overflow: QueueOverflow,
}

fn default_ws_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/public".to_string()
}
fn default_backoff_min_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_liveness_timeout_ms() -> u64 {
    30_000
}
fn default_ping_interval_ms() -> u64 {
    15_000
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_dial_timeout_ms() -> u64 {
    10_000
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_max_topics_per_frame() -> usize {
    50
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            requires_login: false,
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: 0,
            liveness_timeout_ms: default_liveness_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            typed_queue_capacity: default_queue_capacity(),
            raw_queue_capacity: default_queue_capacity(),
            max_topics_per_frame: default_max_topics_per_frame(),
            overflow: QueueOverflow::default(),
        }
    }
}

impl StreamConfig {
    /// 주어진 URL로 기본 설정 생성.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 로그인 필요 여부 설정.
    pub fn with_login(mut self, requires_login: bool) -> Self {
        self.requires_login = requires_login;
        self
    }

    /// 재연결 대기 범위 설정.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min_ms = min.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    /// 활성 감시 시간과 ping 간격 설정.
    pub fn with_liveness(mut self, timeout: Duration, ping_interval: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self.ping_interval_ms = ping_interval.as_millis() as u64;
        self
    }

    /// 큐 용량 설정.
    pub fn with_queue_capacity(mut self, typed: usize, raw: usize) -> Self {
        self.typed_queue_capacity = typed;
        self.raw_queue_capacity = raw;
        self
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn backoff_jitter(&self) -> Duration {
        Duration::from_millis(self.backoff_jitter_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// 스트림 설정 검증. 0 간격의 타이머처럼 세션 실행 중 실패할 값을 거부합니다.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.url.is_empty() {
            return Err(CoreError::Config("stream.url must not be empty".to_string()));
        }
        if self.backoff_min_ms == 0 || self.backoff_min_ms > self.backoff_max_ms {
            return Err(CoreError::Config(format!(
                "stream backoff bounds invalid: min={}ms max={}ms",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }
        if self.liveness_timeout_ms == 0 || self.ping_interval_ms == 0 {
            return Err(CoreError::Config(
                "stream.liveness_timeout_ms and ping_interval_ms must be > 0".to_string(),
            ));
        }
        if self.auth_timeout_ms == 0 || self.dial_timeout_ms == 0 {
            return Err(CoreError::Config(
                "stream.auth_timeout_ms and dial_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.typed_queue_capacity == 0 {
            return Err(CoreError::Config(
                "stream.typed_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.max_topics_per_frame == 0 {
            return Err(CoreError::Config(
                "stream.max_topics_per_frame must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨 필터 (예: "info", "venue_gateway=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 출력 형식
    #[serde(default)]
    pub format: LogFormat,
    /// 파일명과 줄 번호 포함 여부
    #[serde(default)]
    pub with_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            with_file: false,
        }
    }
}
