//! 세션 상태 머신 상태와 재연결 백오프.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// 스트리밍 세션 상태.
///
/// `Disconnected → Dialing → Connected → Authenticating → Ready → Disconnected → Backoff → Dialing`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 소켓 없음 (시작 전 또는 연결 해제 직후)
    Disconnected,
    /// 연결 시도 중
    Dialing,
    /// 소켓 연결됨, 아직 준비 안 됨
    Connected,
    /// 로그인 응답 대기 중
    Authenticating,
    /// 구독 재조정이 끝나 요청 가능
    Ready,
    /// 재연결 대기 중
    Backoff,
    /// 종료됨 (종단 상태)
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    /// 상태 전이가 허용되는지 확인.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Disconnected, Dialing) | (Disconnected, Backoff) => true,
            (Dialing, Connected) | (Dialing, Disconnected) => true,
            (Connected, Authenticating) | (Connected, Ready) | (Connected, Disconnected) => true,
            (Authenticating, Ready) | (Authenticating, Disconnected) => true,
            (Ready, Disconnected) => true,
            (Backoff, Dialing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Dialing => "dialing",
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Backoff => "backoff",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 지수 백오프 (상한 있음, 선택적 지터).
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        Self {
            min,
            max,
            jitter,
            current: min,
        }
    }

    /// 다음 대기 시간을 반환하고 내부 값을 두 배로 늘립니다.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        (base + Duration::from_millis(extra)).min(self.max + self.jitter)
    }

    /// 다음에 사용할 기본 대기 시간 (지터 제외).
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Ready 진입 시 최소값으로 초기화.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
