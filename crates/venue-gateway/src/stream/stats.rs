//! 세션 카운터와 관측용 스냅샷.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::SessionState;

/// 세션 원자 카운터. 제어 태스크가 증가시키고 스냅샷이 읽습니다.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub dial_attempts: AtomicU64,
    pub connects: AtomicU64,
    pub reconnects: AtomicU64,
    pub subscribe_attempts: AtomicU64,
    pub subscribe_ok: AtomicU64,
    pub subscribe_err: AtomicU64,
    pub unsubscribe_attempts: AtomicU64,
    pub unsubscribe_ok: AtomicU64,
    pub unsubscribe_err: AtomicU64,
    pub ops_sent: AtomicU64,
    pub pings_sent: AtomicU64,
    pub frames_received: AtomicU64,
}

impl SessionCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// 분배 큐 관측값.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub dropped: u64,
}

/// 마지막 에러와 발생 시각.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// 세션 상태의 불변 스냅샷.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub dial_attempts: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub subscribe_attempts: u64,
    pub subscribe_ok: u64,
    pub subscribe_err: u64,
    pub unsubscribe_attempts: u64,
    pub unsubscribe_ok: u64,
    pub unsubscribe_err: u64,
    pub ops_sent: u64,
    pub pings_sent: u64,
    pub frames_received: u64,
    /// 희망 구독 수
    pub desired_subscriptions: usize,
    /// 응답 대기 중인 오퍼레이션 수
    pub pending_ops: usize,
    pub typed_queue: QueueStats,
    /// raw 큐가 비활성이면 `None`
    pub raw_queue: Option<QueueStats>,
    /// 다음 재연결 대기 시간
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
    pub last_recv_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
    /// 마지막 하트비트 응답 시각
    pub last_pong_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
}

/// 스냅샷 구성에 필요한 게이지 값들.
#[derive(Debug, Clone)]
pub(crate) struct Gauges {
    pub state: SessionState,
    pub desired_subscriptions: usize,
    pub pending_ops: usize,
    pub typed_queue: QueueStats,
    pub raw_queue: Option<QueueStats>,
    pub backoff: Duration,
    pub last_recv_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
}

impl SessionStats {
    pub(crate) fn capture(counters: &SessionCounters, gauges: Gauges) -> Self {
        Self {
            state: gauges.state,
            dial_attempts: SessionCounters::get(&counters.dial_attempts),
            connects: SessionCounters::get(&counters.connects),
            reconnects: SessionCounters::get(&counters.reconnects),
            subscribe_attempts: SessionCounters::get(&counters.subscribe_attempts),
            subscribe_ok: SessionCounters::get(&counters.subscribe_ok),
            subscribe_err: SessionCounters::get(&counters.subscribe_err),
            unsubscribe_attempts: SessionCounters::get(&counters.unsubscribe_attempts),
            unsubscribe_ok: SessionCounters::get(&counters.unsubscribe_ok),
            unsubscribe_err: SessionCounters::get(&counters.unsubscribe_err),
            ops_sent: SessionCounters::get(&counters.ops_sent),
            pings_sent: SessionCounters::get(&counters.pings_sent),
            frames_received: SessionCounters::get(&counters.frames_received),
            desired_subscriptions: gauges.desired_subscriptions,
            pending_ops: gauges.pending_ops,
            typed_queue: gauges.typed_queue,
            raw_queue: gauges.raw_queue,
            backoff: gauges.backoff,
            last_recv_at: gauges.last_recv_at,
            last_ping_at: gauges.last_ping_at,
            last_pong_at: gauges.last_pong_at,
            last_error: gauges.last_error,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached_copy() {
        let counters = SessionCounters::default();
        SessionCounters::incr(&counters.dial_attempts);
        SessionCounters::add(&counters.subscribe_attempts, 3);

        let gauges = Gauges {
            state: SessionState::Ready,
            desired_subscriptions: 2,
            pending_ops: 0,
            typed_queue: QueueStats {
                len: 1,
                capacity: 8,
                dropped: 0,
            },
            raw_queue: None,
            backoff: Duration::from_millis(500),
            last_recv_at: None,
            last_ping_at: None,
            last_pong_at: None,
            last_error: None,
        };
        let stats = SessionStats::capture(&counters, gauges);

        // 스냅샷 이후 변경은 반영되지 않음
        SessionCounters::incr(&counters.dial_attempts);
        assert_eq!(stats.dial_attempts, 1);
        assert_eq!(stats.subscribe_attempts, 3);

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["state"], "ready");
        assert_eq!(value["backoff"], 500);
    }
}
