//! 읽기 루프와 소비자를 분리하는 제한 용량 분배 큐.
//!
//! `push`는 절대 대기하지 않습니다. 용량이 가득 차면 [`QueueOverflow`] 정책에 따라
//! 가장 오래된 항목 또는 새 항목을 버리고 버린 개수를 셉니다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use venue_core::QueueOverflow;

use crate::{GatewayError, GatewayResult};

#[derive(Debug)]
struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: QueueOverflow,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// 제한 용량 분배 큐 핸들. 복제본은 같은 큐를 공유합니다.
#[derive(Debug)]
pub struct DispatchQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> DispatchQueue<T> {
    /// 새 큐 생성. 용량 0은 1로 보정됩니다.
    pub fn new(capacity: usize, policy: QueueOverflow) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity,
                policy,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.shared.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 항목 추가. 큐에 들어갔으면 `true`, 버려졌으면(새 항목 또는 종료 후) `false`.
    ///
    /// `DropOldest` 정책에서 밀려난 기존 항목도 버림 카운트에 포함됩니다.
    pub fn push(&self, item: T) -> bool {
        if self.is_closed() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let accepted = {
            let mut items = self.lock();
            if items.len() < self.shared.capacity {
                items.push_back(item);
                true
            } else {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                match self.shared.policy {
                    QueueOverflow::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        true
                    }
                    QueueOverflow::DropNewest => false,
                }
            }
        };

        if accepted {
            self.shared.notify.notify_one();
        }
        accepted
    }

    /// 대기 없이 하나 꺼내기.
    pub fn try_recv(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// 다음 항목을 기다립니다.
    ///
    /// 종료된 큐는 남은 항목을 모두 돌려준 뒤 [`GatewayError::Stopped`]를 반환합니다.
    pub async fn recv(&self) -> GatewayResult<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // push/close 알림을 놓치지 않도록 확인 전에 등록
            notified.as_mut().enable();

            if let Some(item) = self.try_recv() {
                return Ok(item);
            }
            if self.is_closed() {
                return Err(GatewayError::Stopped);
            }

            notified.await;
        }
    }

    /// 큐 종료. 대기 중인 모든 `recv`가 깨어납니다.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// 현재 적재된 항목 수.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> QueueOverflow {
        self.shared.policy
    }

    /// 누적 버림 개수.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
