//! REST 요청 게이트.
//!
//! 모든 외부 REST 호출은 다음 순서로 승인됩니다:
//!
//! ```text
//! 동시성 슬롯 ──> 전역 토큰 버킷 ──> 라우트 토큰 버킷 ──> 호출
//! ```
//!
//! 어느 단계에서든 취소되면 그때까지 획득한 자원을 모두 반납하고 에러를 반환합니다.
//! 라우트 한도기 맵은 실행 중에도 교체될 수 있으며, 조회는 읽기 잠금 아래에서
//! `Arc`만 복제한 뒤 잠금 밖에서 대기합니다.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reqwest::Method;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use venue_core::RateLimitConfig;

use super::bucket::TokenBucket;
use super::semaphore::AdmissionSemaphore;
use crate::GatewayResult;

/// 스트림 오퍼레이션 라우트에 쓰이는 메서드 이름.
pub const STREAM_OP_METHOD: &str = "WS";

/// 요청 한도가 적용되는 라우트 식별자.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    method: String,
    endpoint: String,
}

impl RouteKey {
    /// 메서드와 경로로 라우트 생성. 메서드는 대문자로 정규화됩니다.
    pub fn new(method: impl AsRef<str>, endpoint: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_uppercase(),
            endpoint: endpoint.into(),
        }
    }

    /// REST 라우트.
    pub fn rest(method: &Method, path: impl Into<String>) -> Self {
        Self::new(method.as_str(), path)
    }

    /// 스트림 오퍼레이션 라우트.
    pub fn stream_op(op: impl Into<String>) -> Self {
        Self::new(STREAM_OP_METHOD, op)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.endpoint)
    }
}

/// 게이트 통과 권한.
///
/// 동시성 슬롯을 보유하며 `release()` 또는 drop 시 반납합니다.
/// `release()`는 여러 번 호출해도 안전합니다.
#[derive(Debug)]
pub struct GatePermit {
    slot: Option<OwnedSemaphorePermit>,
}

impl GatePermit {
    /// 보유한 슬롯을 반납합니다.
    pub fn release(&mut self) {
        self.slot.take();
    }

    /// 아직 슬롯을 보유하고 있는지 확인.
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }
}

/// 게이트 상태 스냅샷.
#[derive(Debug, Clone, PartialEq)]
pub struct GateStats {
    /// 진행 중인 요청 수
    pub in_flight: usize,
    /// 최대 동시 요청 수 (제한 없으면 None)
    pub max_concurrent: Option<usize>,
    /// 전역 버킷의 남은 토큰 (없으면 None)
    pub global_available: Option<f64>,
    /// 등록된 라우트 한도기 수
    pub route_limiters: usize,
}

/// 동시성 세마포어, 전역 버킷, 라우트별 버킷을 조합한 요청 게이트.
#[derive(Debug, Default)]
pub struct RequestGate {
    semaphore: Option<AdmissionSemaphore>,
    global: Option<Arc<TokenBucket>>,
    routes: RwLock<HashMap<RouteKey, Arc<TokenBucket>>>,
}

impl RequestGate {
    /// 구성 요소를 직접 지정해 생성.
    pub fn new(max_concurrent: Option<usize>, global: Option<TokenBucket>) -> Self {
        Self {
            semaphore: max_concurrent.filter(|n| *n > 0).map(AdmissionSemaphore::new),
            global: global.filter(|b| !b.is_disabled()).map(Arc::new),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// 아무 제한도 하지 않는 게이트.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// 설정에서 게이트 생성.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            info!("Request gate disabled by configuration");
            return Self::disabled();
        }

        let gate = Self::new(
            Some(config.max_concurrent),
            Some(TokenBucket::new(config.global_rps, config.global_burst)),
        );

        for route in &config.routes {
            gate.set_route_limiter(
                RouteKey::new(&route.method, route.endpoint.clone()),
                Some(Arc::new(TokenBucket::new(route.rps, route.burst))),
            );
        }

        info!(
            max_concurrent = config.max_concurrent,
            global_rps = config.global_rps,
            global_burst = config.global_burst,
            routes = config.routes.len(),
            "Request gate configured"
        );
        gate
    }

    fn read_routes(&self) -> RwLockReadGuard<'_, HashMap<RouteKey, Arc<TokenBucket>>> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, HashMap<RouteKey, Arc<TokenBucket>>> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 요청 하나를 승인받습니다.
    ///
    /// 반환된 [`GatePermit`]는 호출이 끝날 때까지 보유해야 합니다.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        method: &str,
        endpoint: &str,
    ) -> GatewayResult<GatePermit> {
        self.acquire_route(cancel, &RouteKey::new(method, endpoint)).await
    }

    /// [`RouteKey`]로 요청을 승인받습니다.
    pub async fn acquire_route(
        &self,
        cancel: &CancellationToken,
        key: &RouteKey,
    ) -> GatewayResult<GatePermit> {
        // 이후 단계에서 실패하면 permit이 drop되며 슬롯이 반납됨
        let mut permit = GatePermit { slot: None };

        if let Some(semaphore) = &self.semaphore {
            permit.slot = Some(semaphore.acquire(cancel).await?);
        }

        if let Some(global) = &self.global {
            global.wait(cancel).await?;
        }

        if let Some(limiter) = self.route_limiter(key) {
            limiter.wait(cancel).await?;
        }

        Ok(permit)
    }

    /// 라우트 한도기 설정. `None`이면 해당 라우트의 한도기를 제거합니다.
    pub fn set_route_limiter(&self, key: RouteKey, limiter: Option<Arc<TokenBucket>>) {
        let mut routes = self.write_routes();
        match limiter {
            Some(limiter) => {
                debug!(
                    route = %key,
                    rate = limiter.rate(),
                    burst = limiter.burst(),
                    "Route limiter set"
                );
                routes.insert(key, limiter);
            }
            None => {
                debug!(route = %key, "Route limiter removed");
                routes.remove(&key);
            }
        }
    }

    /// 여러 라우트에 같은 한도를 설치합니다.
    ///
    /// 이미 같은 `rate`/`burst`의 한도기가 있는 라우트는 기존 버킷(과 남은 토큰)을 유지합니다.
    /// 교체된 라우트 수를 반환합니다.
    pub fn refresh_route_limiters<F>(&self, keys: &[RouteKey], make: F) -> usize
    where
        F: Fn() -> TokenBucket,
    {
        let template = make();
        let mut routes = self.write_routes();
        let mut replaced = 0;
        for key in keys {
            let unchanged = routes
                .get(key)
                .is_some_and(|b| b.rate() == template.rate() && b.burst() == template.burst());
            if !unchanged {
                routes.insert(key.clone(), Arc::new(make()));
                replaced += 1;
            }
        }
        replaced
    }

    /// 라우트 한도기 맵 전체를 교체합니다.
    pub fn replace_route_limiters(&self, limiters: HashMap<RouteKey, Arc<TokenBucket>>) {
        let mut routes = self.write_routes();
        *routes = limiters;
    }

    /// 라우트의 현재 한도기.
    pub fn route_limiter(&self, key: &RouteKey) -> Option<Arc<TokenBucket>> {
        self.read_routes().get(key).cloned()
    }

    /// 라우트 한도기 맵의 일관된 복사본.
    pub fn route_snapshot(&self) -> HashMap<RouteKey, Arc<TokenBucket>> {
        self.read_routes().clone()
    }

    /// 현재 상태 스냅샷.
    pub fn stats(&self) -> GateStats {
        GateStats {
            in_flight: self.semaphore.as_ref().map_or(0, |s| s.in_flight()),
            max_concurrent: self.semaphore.as_ref().map(|s| s.capacity()),
            global_available: self.global.as_ref().map(|g| g.available()),
            route_limiters: self.read_routes().len(),
        }
    }
}
