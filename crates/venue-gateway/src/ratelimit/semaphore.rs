//! 동시 요청 수 제한.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{GatewayError, GatewayResult};

/// 진행 중인 REST 호출 수를 제한하는 세마포어.
#[derive(Debug, Clone)]
pub struct AdmissionSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionSemaphore {
    /// 최대 `capacity`개의 동시 슬롯을 갖는 세마포어 생성.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 슬롯 하나를 획득합니다. 반환된 permit이 drop되면 슬롯이 반납됩니다.
    pub async fn acquire(&self, cancel: &CancellationToken) -> GatewayResult<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(GatewayError::Cancelled("concurrency slot wait".to_string()))
            }
            permit = self.inner.clone().acquire_owned() => {
                // 세마포어를 닫지 않으므로 에러는 발생하지 않음
                permit.map_err(|_| GatewayError::Stopped)
            }
        }
    }

    /// 설정된 최대 동시 슬롯 수.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 현재 사용 중인 슬롯 수.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.inner.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_returned_on_drop() {
        let sem = AdmissionSemaphore::new(2);
        let cancel = CancellationToken::new();

        let a = sem.acquire(&cancel).await.unwrap();
        let _b = sem.acquire(&cancel).await.unwrap();
        assert_eq!(sem.in_flight(), 2);

        drop(a);
        assert_eq!(sem.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_while_full() {
        let sem = AdmissionSemaphore::new(1);
        let cancel = CancellationToken::new();
        let _held = sem.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let result = sem.acquire(&waiter_cancel).await;
        assert!(matches!(result, Err(GatewayError::Cancelled(_))));
        assert_eq!(sem.in_flight(), 1);
    }
}
