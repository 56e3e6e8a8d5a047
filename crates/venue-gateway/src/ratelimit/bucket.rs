//! 토큰 버킷 요청 한도기.
//!
//! 초당 `rate`개의 토큰이 연속적으로 채워지고 최대 `burst`개까지 쌓입니다.
//! 토큰은 매 획득 시도 시 경과 시간만큼 지연 보충됩니다.
//!
//! `rate` 또는 `burst`가 0 이하(또는 유한하지 않은 값)인 버킷은 "비활성"으로
//! 취급되어 항상 즉시 허용합니다. 이는 설정되지 않은 한도기에만 해당하며,
//! 서버 쿼터로부터 계산된 한도기는 [`super::quota`]에서 최소 용량 1로 보정됩니다.
//!
//! 유효한 버킷의 `burst`는 최소 1로 올려집니다. 1 미만이면 토큰 하나를 끝내 채울 수 없습니다.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{GatewayError, GatewayResult};

/// 활성 버킷의 최소 버스트 용량.
const MIN_BURST: f64 = 1.0;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// 단일 자원용 토큰 버킷.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// 새 버킷 생성. 처음에는 가득 찬 상태입니다.
    pub fn new(rate: f64, burst: f64) -> Self {
        let (rate, burst) = if Self::valid(rate) && Self::valid(burst) {
            (rate, burst.max(MIN_BURST))
        } else {
            (0.0, 0.0)
        };

        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// `window` 동안 `count`회를 허용하는 버킷 생성.
    pub fn per_window(count: f64, window: Duration) -> Self {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return Self::new(0.0, 0.0);
        }
        Self::new(count / secs, count)
    }

    fn valid(value: f64) -> bool {
        value.is_finite() && value > 0.0
    }

    /// 초당 보충 토큰 수.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// 버스트 용량.
    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// 비활성(항상 허용) 버킷인지 확인.
    pub fn is_disabled(&self) -> bool {
        self.rate <= 0.0 || self.burst <= 0.0
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
            state.last_refill = now;
        }
    }

    /// 토큰 하나를 소비하거나, 다음 토큰까지 남은 시간을 반환합니다.
    fn reserve(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - state.tokens;
        Err(Duration::try_from_secs_f64(deficit / self.rate).unwrap_or(Duration::MAX))
    }

    /// 대기 없이 토큰 하나를 획득 시도.
    pub fn try_acquire(&self) -> bool {
        if self.is_disabled() {
            return true;
        }
        self.reserve().is_ok()
    }

    /// 토큰 하나를 획득할 때까지 대기합니다.
    ///
    /// `cancel`이 먼저 취소되면 [`GatewayError::Cancelled`]를 반환하며 토큰은 소비되지 않습니다.
    pub async fn wait(&self, cancel: &CancellationToken) -> GatewayResult<()> {
        if self.is_disabled() {
            return Ok(());
        }

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled("rate limit wait".to_string()));
            }

            let delay = match self.reserve() {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GatewayError::Cancelled("rate limit wait".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 현재 사용 가능한 토큰 수 (보충 반영).
    pub fn available(&self) -> f64 {
        if self.is_disabled() {
            return f64::INFINITY;
        }
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_rate_limited() {
        // rate=10, burst=20: 25회 즉시 호출 시 20회는 바로, 5회는 지연
        let bucket = TokenBucket::new(10.0, 20.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..20 {
            bucket.wait(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..5 {
            bucket.wait(&cancel).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(499), "elapsed={:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(530), "elapsed={:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_throughput_converges_to_rate() {
        let bucket = TokenBucket::new(5.0, 1.0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..51 {
            bucket.wait(&cancel).await.unwrap();
        }

        // 첫 토큰은 즉시, 이후 50개는 초당 5개
        let secs = start.elapsed().as_secs_f64();
        assert!((secs - 10.0).abs() < 0.2, "secs={}", secs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_promptly() {
        let bucket = TokenBucket::new(0.1, 1.0);
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = bucket.wait(&cancel).await;
        assert!(matches!(result, Err(GatewayError::Cancelled(_))));
        // 10초 보충 주기를 기다리지 않음
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_disabled_bucket_always_permits() {
        for (rate, burst) in [(0.0, 10.0), (10.0, 0.0), (-1.0, -1.0), (f64::NAN, 1.0)] {
            let bucket = TokenBucket::new(rate, burst);
            assert!(bucket.is_disabled());
            for _ in 0..1000 {
                assert!(bucket.try_acquire());
            }
        }
    }

    #[test]
    fn test_per_window() {
        let bucket = TokenBucket::per_window(60.0, Duration::from_secs(2));
        assert_eq!(bucket.rate(), 30.0);
        assert_eq!(bucket.burst(), 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_burst_raised_to_one_token() {
        let bucket = TokenBucket::new(10.0, 0.5);
        assert!(!bucket.is_disabled());
        assert_eq!(bucket.burst(), MIN_BURST);

        let cancel = CancellationToken::new();
        let start = Instant::now();
        bucket.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // 다음 토큰은 rate에 맞춰 보충됨
        let waited = tokio::time::timeout(Duration::from_secs(1), bucket.wait(&cancel)).await;
        assert!(waited.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_burst() {
        let bucket = TokenBucket::new(100.0, 3.0);
        assert!(bucket.try_acquire());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 3.0);
    }

    proptest! {
        #[test]
        fn prop_immediate_acquisitions_never_exceed_burst(
            rate in 0.5f64..1000.0,
            burst in 1u32..200,
        ) {
            let bucket = TokenBucket::new(rate, burst as f64);
            let mut granted = 0u32;
            for _ in 0..(burst * 2 + 5) {
                if bucket.try_acquire() {
                    granted += 1;
                }
            }
            // 테스트 실행 중에도 실제 시간이 흐르므로 소량의 보충은 허용
            let slack = (rate * 0.05).ceil() as u32 + 1;
            prop_assert!(granted >= burst);
            prop_assert!(granted <= burst + slack);
            let available = bucket.available();
            prop_assert!(available >= 0.0 && available <= burst as f64);
        }
    }
}
