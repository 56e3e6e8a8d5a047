//! 스트림 오퍼레이션 요청/응답 상관.
//!
//! 요청마다 증가하는 ID를 발급하고 대기자(waiter)를 등록합니다.
//! 읽기 루프가 같은 ID의 응답을 받으면 해당 대기자에게 정확히 한 번 전달합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::frame::OpReply;
use crate::{GatewayError, GatewayResult};

type Slot = oneshot::Sender<GatewayResult<OpReply>>;

#[derive(Debug, Default)]
struct Registry {
    waiters: HashMap<String, Slot>,
    closed: Option<GatewayError>,
}

/// 대기자 레지스트리.
#[derive(Debug, Default)]
pub struct OpCorrelator {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl OpCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 새 ID로 대기자 등록. 종료된 레지스트리에서는 종료 에러를 반환합니다.
    pub fn register(self: &Arc<Self>) -> GatewayResult<OpWaiter> {
        let mut registry = self.lock();
        if let Some(err) = &registry.closed {
            return Err(err.clone());
        }

        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        registry.waiters.insert(id.clone(), tx);

        Ok(OpWaiter {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// 대기자에게 결과 전달. 알 수 없거나 이미 처리된 ID면 `false`.
    pub fn resolve(&self, id: &str, result: GatewayResult<OpReply>) -> bool {
        let slot = self.lock().waiters.remove(id);
        match slot {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                debug!(id, "Reply for unknown or resolved op dropped");
                false
            }
        }
    }

    /// 가장 오래된(ID가 가장 작은) 대기자에게 결과 전달.
    ///
    /// ID 없이 도착한 에러 이벤트를 귀속시킬 때 사용합니다.
    pub fn resolve_oldest(&self, result: GatewayResult<OpReply>) -> bool {
        let slot = {
            let mut registry = self.lock();
            let oldest = registry
                .waiters
                .keys()
                .min_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX))
                .cloned();
            oldest.and_then(|id| registry.waiters.remove(&id))
        };
        slot.map(|tx| tx.send(result).is_ok()).unwrap_or(false)
    }

    /// 모든 대기자에게 에러 전달 (연결 끊김). 전달된 수를 반환합니다.
    pub fn fail_all(&self, err: GatewayError) -> usize {
        let waiters: Vec<Slot> = self.lock().waiters.drain().map(|(_, tx)| tx).collect();
        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    /// 레지스트리 종료. 남은 대기자에게 에러를 전달하고 이후 등록을 거부합니다.
    pub fn close(&self, err: GatewayError) -> usize {
        let waiters: Vec<Slot> = {
            let mut registry = self.lock();
            registry.closed = Some(err.clone());
            registry.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    /// 대기 중인 요청 수.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    fn remove(&self, id: &str) {
        self.lock().waiters.remove(id);
    }
}

/// 등록된 단일 요청의 대기 핸들.
///
/// 결과를 받기 전에 drop되면 레지스트리에서 제거됩니다.
#[derive(Debug)]
pub struct OpWaiter {
    id: String,
    rx: oneshot::Receiver<GatewayResult<OpReply>>,
    correlator: Arc<OpCorrelator>,
}

impl OpWaiter {
    /// 요청 ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 응답, 에러 또는 취소 중 먼저 일어나는 것을 기다립니다.
    pub async fn wait(mut self, cancel: &CancellationToken) -> GatewayResult<OpReply> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(GatewayError::Cancelled(format!("op {} wait", self.id)))
            }
            result = &mut self.rx => {
                result.unwrap_or_else(|_| Err(GatewayError::Stopped))
            }
        }
    }
}

impl Drop for OpWaiter {
    fn drop(&mut self) {
        self.correlator.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reply(id: &str) -> OpReply {
        OpReply {
            id: id.to_string(),
            op: "order".to_string(),
            code: "0".to_string(),
            msg: String::new(),
            data: Vec::new(),
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let correlator = Arc::new(OpCorrelator::new());
        let waiter = correlator.register().unwrap();
        let id = waiter.id().to_string();

        assert!(correlator.resolve(&id, Ok(reply(&id))));
        // 중복 응답은 무시
        assert!(!correlator.resolve(&id, Ok(reply(&id))));

        let got = waiter.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(got.id, id);
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn test_ids_increase() {
        let correlator = Arc::new(OpCorrelator::new());
        let a = correlator.register().unwrap();
        let b = correlator.register().unwrap();
        assert_eq!(a.id(), "1");
        assert_eq!(b.id(), "2");
    }

    #[tokio::test]
    async fn test_fail_all_reaches_every_waiter() {
        let correlator = Arc::new(OpCorrelator::new());
        let waiters: Vec<_> = (0..5).map(|_| correlator.register().unwrap()).collect();

        let failed = correlator.fail_all(GatewayError::Disconnected("socket closed".to_string()));
        assert_eq!(failed, 5);
        assert_eq!(correlator.pending(), 0);

        for waiter in waiters {
            let result = waiter.wait(&CancellationToken::new()).await;
            assert!(matches!(result, Err(GatewayError::Disconnected(_))));
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let correlator = Arc::new(OpCorrelator::new());
        let waiter = correlator.register().unwrap();
        let id = waiter.id().to_string();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = waiter.wait(&cancel).await;
        assert!(matches!(result, Err(GatewayError::Cancelled(_))));
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.resolve(&id, Ok(reply(&id))));
    }

    #[test]
    fn test_close_rejects_new_waiters() {
        let correlator = Arc::new(OpCorrelator::new());
        let _pending = correlator.register().unwrap();
        assert_eq!(correlator.close(GatewayError::Stopped), 1);
        assert!(matches!(correlator.register(), Err(GatewayError::Stopped)));
    }

    #[tokio::test]
    async fn test_resolve_oldest() {
        let correlator = Arc::new(OpCorrelator::new());
        let first = correlator.register().unwrap();
        let second = correlator.register().unwrap();

        assert!(correlator.resolve_oldest(Err(GatewayError::Protocol("bad op".to_string()))));
        assert!(matches!(
            first.wait(&CancellationToken::new()).await,
            Err(GatewayError::Protocol(_))
        ));
        assert_eq!(correlator.pending(), 1);
        drop(second);
        assert_eq!(correlator.pending(), 0);
    }
}
