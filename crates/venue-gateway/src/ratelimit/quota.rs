//! 서버 보고 쿼터에 따른 라우트 한도기 재설정.
//!
//! 거래 응답 또는 쿼터 조회 응답에 포함된 "윈도우당 N회" 쿼터(`accRateLimit`)를 읽어
//! 해당 액션 계열의 모든 라우트(REST와 스트림 오퍼레이션)에 토큰 버킷을 설치합니다.
//! 1 미만의 양수 쿼터도 용량 1로 올려 설치합니다.
//!
//! # 판정 규칙 (fail-closed)
//!
//! | 주 쿼터 | 보조 쿼터 | 결과 |
//! |---|---|---|
//! | 양수 | - | 주 쿼터 사용 |
//! | 없음/0 이하 | 양수 | 보조 쿼터 사용 |
//! | 없음/0 이하 | 없음/0 이하 | 최소 한도기 (윈도우당 1회) |
//! | 해석 불가 | - | 최소 한도기 + 에러 보고 |
//!
//! 모호하거나 소진된 쿼터는 절대 "무제한"으로 해석하지 않습니다.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::bucket::TokenBucket;
use super::gate::{RequestGate, RouteKey};
use crate::{GatewayError, GatewayResult};

/// 주문 계열 쿼터 윈도우.
pub const ORDER_QUOTA_WINDOW: Duration = Duration::from_secs(2);

/// 계정 쿼터 조회 엔드포인트.
pub const ACCOUNT_RATE_LIMIT_PATH: &str = "/api/v5/trade/account-rate-limit";

/// 서버가 보고한 쿼터.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    /// 현재 윈도우 허용 횟수
    #[serde(default, deserialize_with = "string_or_number")]
    pub acc_rate_limit: Option<String>,
    /// 다음 윈도우 허용 횟수
    #[serde(default, deserialize_with = "string_or_number")]
    pub next_acc_rate_limit: Option<String>,
    /// 보고 시각 (밀리초 문자열)
    #[serde(default, deserialize_with = "string_or_number")]
    pub ts: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl QuotaReport {
    /// 주 쿼터 값으로 생성.
    pub fn new(acc_rate_limit: impl Into<String>) -> Self {
        Self {
            acc_rate_limit: Some(acc_rate_limit.into()),
            ..Default::default()
        }
    }

    /// 보조 쿼터 설정.
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next_acc_rate_limit = Some(next.into());
        self
    }

    /// 보고 시각 설정.
    pub fn with_ts(mut self, ts: impl Into<String>) -> Self {
        self.ts = Some(ts.into());
        self
    }

    /// 응답 JSON에서 쿼터 필드 추출.
    ///
    /// `data[0]` 또는 최상위 객체에 `accRateLimit`이 있으면 반환합니다.
    pub fn from_response(value: &Value) -> Option<Self> {
        let candidate = value
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .filter(|v| v.get("accRateLimit").is_some())
            .or_else(|| value.get("accRateLimit").map(|_| value))?;

        serde_json::from_value(candidate.clone()).ok()
    }
}

/// 계산된 유효 쿼터.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveQuota {
    /// 윈도우당 허용 횟수
    pub per_window: f64,
    /// 초당 보충률
    pub rate: f64,
    /// 버스트 용량
    pub burst: f64,
    /// 쿼터를 해석하지 못해 최소 한도기로 대체되었는지 여부
    pub minimal: bool,
}

impl EffectiveQuota {
    fn from_count(count: f64, window: Duration, minimal: bool) -> Self {
        Self {
            per_window: count,
            rate: count / window.as_secs_f64(),
            burst: count.max(1.0),
            minimal,
        }
    }
}

enum Parsed {
    Missing,
    Value(f64),
    Malformed(String),
}

fn parse_quota(raw: Option<&str>) -> Parsed {
    match raw.map(str::trim) {
        None | Some("") => Parsed::Missing,
        Some(s) => match s.parse::<f64>() {
            Ok(v) if v.is_finite() => Parsed::Value(v),
            _ => Parsed::Malformed(s.to_string()),
        },
    }
}

/// 한 액션 계열의 쿼터 동기화기.
#[derive(Debug)]
pub struct QuotaSync {
    gate: Arc<RequestGate>,
    window: Duration,
    routes: Vec<RouteKey>,
    reporting: Vec<RouteKey>,
    last_ts: Mutex<Option<i64>>,
}

impl QuotaSync {
    /// 게이트, 윈도우, 대상 라우트로 생성.
    pub fn new(gate: Arc<RequestGate>, window: Duration, routes: Vec<RouteKey>) -> Self {
        Self {
            gate,
            window,
            routes,
            reporting: Vec::new(),
            last_ts: Mutex::new(None),
        }
    }

    /// 이 계열의 쿼터를 보고하지만 한도는 적용받지 않는 라우트 추가.
    pub fn with_reporting_route(mut self, key: RouteKey) -> Self {
        self.reporting.push(key);
        self
    }

    /// 주문 계열 (REST 주문/정정 + 동일 스트림 오퍼레이션, 2초 윈도우).
    pub fn order_family(gate: Arc<RequestGate>) -> Self {
        let mut routes: Vec<RouteKey> = [
            "/api/v5/trade/order",
            "/api/v5/trade/batch-orders",
            "/api/v5/trade/amend-order",
            "/api/v5/trade/amend-batch-orders",
        ]
        .into_iter()
        .map(|path| RouteKey::rest(&Method::POST, path))
        .collect();

        routes.extend(
            ["order", "batch-orders", "amend-order", "batch-amend-orders"]
                .into_iter()
                .map(RouteKey::stream_op),
        );

        Self::new(gate, ORDER_QUOTA_WINDOW, routes)
            .with_reporting_route(RouteKey::rest(&Method::GET, ACCOUNT_RATE_LIMIT_PATH))
    }

    /// 대상 라우트 목록.
    pub fn routes(&self) -> &[RouteKey] {
        &self.routes
    }

    /// 해당 라우트가 이 계열에 속하는지 확인.
    pub fn governs(&self, key: &RouteKey) -> bool {
        self.routes.contains(key)
    }

    /// 해당 라우트의 응답을 쿼터 보고로 받아들이는지 확인.
    pub fn accepts_reports_from(&self, key: &RouteKey) -> bool {
        self.governs(key) || self.reporting.contains(key)
    }

    /// 보고된 쿼터로부터 유효 쿼터를 계산합니다.
    ///
    /// 필요한 값을 해석하지 못하면 최소 쿼터와 함께 에러를 돌려줍니다.
    pub fn effective_quota(&self, report: &QuotaReport) -> (EffectiveQuota, Option<GatewayError>) {
        let minimal = EffectiveQuota::from_count(1.0, self.window, true);

        match parse_quota(report.acc_rate_limit.as_deref()) {
            Parsed::Value(v) if v > 0.0 => {
                return (EffectiveQuota::from_count(v, self.window, false), None);
            }
            Parsed::Malformed(raw) => {
                return (
                    minimal,
                    Some(GatewayError::Quota(format!("unparsable accRateLimit: {:?}", raw))),
                );
            }
            Parsed::Value(_) | Parsed::Missing => {}
        }

        match parse_quota(report.next_acc_rate_limit.as_deref()) {
            Parsed::Value(v) if v > 0.0 => {
                (EffectiveQuota::from_count(v, self.window, false), None)
            }
            Parsed::Malformed(raw) => (
                minimal,
                Some(GatewayError::Quota(format!("unparsable nextAccRateLimit: {:?}", raw))),
            ),
            Parsed::Value(_) | Parsed::Missing => (minimal, None),
        }
    }

    /// 쿼터를 계열의 모든 라우트에 설치합니다.
    ///
    /// 이미 적용한 보고보다 오래된 보고(`ts` 기준)는 건너뛰고 `Ok(None)`을 반환합니다.
    /// 해석 불가 쿼터는 최소 한도기를 설치한 뒤 에러를 반환합니다.
    pub fn apply(&self, report: &QuotaReport) -> GatewayResult<Option<EffectiveQuota>> {
        let ts = report.ts.as_deref().and_then(|t| t.trim().parse::<i64>().ok());
        if let Some(ts) = ts {
            let mut last = self.last_ts.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|prev| ts <= prev) {
                debug!(ts, "Stale quota report skipped");
                return Ok(None);
            }
            *last = Some(ts);
        }

        let (quota, error) = self.effective_quota(report);
        self.install(&quota);

        match error {
            Some(err) => {
                warn!(error = %err, "Quota report unusable, installed minimal limiter");
                Err(err)
            }
            None => {
                if quota.minimal {
                    warn!(
                        acc_rate_limit = ?report.acc_rate_limit,
                        next_acc_rate_limit = ?report.next_acc_rate_limit,
                        "Quota exhausted or missing, installed minimal limiter"
                    );
                } else {
                    info!(
                        per_window = quota.per_window,
                        window_ms = self.window.as_millis() as u64,
                        routes = self.routes.len(),
                        "Route limiters reprogrammed from server quota"
                    );
                }
                Ok(Some(quota))
            }
        }
    }

    /// 응답 JSON에 쿼터가 있으면 적용합니다.
    pub fn apply_from_response(&self, value: &Value) -> GatewayResult<Option<EffectiveQuota>> {
        match QuotaReport::from_response(value) {
            Some(report) => self.apply(&report),
            None => Ok(None),
        }
    }

    fn install(&self, quota: &EffectiveQuota) {
        // 라우트마다 독립된 버킷 (REST와 스트림이 서로의 토큰을 소비하지 않음)
        let replaced = self.gate.refresh_route_limiters(&self.routes, || {
            TokenBucket::per_window(quota.per_window, self.window)
        });
        debug!(replaced, routes = self.routes.len(), "Route limiters refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sync() -> (Arc<RequestGate>, QuotaSync) {
        let gate = Arc::new(RequestGate::disabled());
        let sync = QuotaSync::order_family(gate.clone());
        (gate, sync)
    }

    fn order_route() -> RouteKey {
        RouteKey::rest(&Method::POST, "/api/v5/trade/order")
    }

    #[test]
    fn test_positive_quota_installed_on_rest_and_stream_routes() {
        let (gate, sync) = sync();
        let quota = sync.apply(&QuotaReport::new("1000")).unwrap().unwrap();

        assert_eq!(quota.per_window, 1000.0);
        assert_eq!(quota.rate, 500.0);
        assert!(!quota.minimal);

        let rest = gate.route_limiter(&order_route()).unwrap();
        let ws = gate.route_limiter(&RouteKey::stream_op("order")).unwrap();
        assert_eq!(rest.burst(), 1000.0);
        assert_eq!(ws.rate(), 500.0);
        assert!(!Arc::ptr_eq(&rest, &ws));
    }

    #[test]
    fn test_zero_quota_without_secondary_is_capacity_one() {
        let (gate, sync) = sync();
        let quota = sync.apply(&QuotaReport::new("0")).unwrap().unwrap();

        assert!(quota.minimal);
        let limiter = gate.route_limiter(&order_route()).unwrap();
        assert!(!limiter.is_disabled());
        assert_eq!(limiter.burst(), 1.0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_zero_quota_falls_back_to_secondary() {
        let (gate, sync) = sync();
        let quota = sync
            .apply(&QuotaReport::new("0").with_next("40"))
            .unwrap()
            .unwrap();

        assert_eq!(quota.per_window, 40.0);
        assert_eq!(gate.route_limiter(&order_route()).unwrap().burst(), 40.0);
    }

    #[test]
    fn test_missing_both_is_minimal() {
        let (_, sync) = sync();
        let (quota, err) = sync.effective_quota(&QuotaReport::default());
        assert!(quota.minimal);
        assert!(err.is_none());

        let (quota, _) = sync.effective_quota(&QuotaReport::new("-5").with_next("0"));
        assert!(quota.minimal);
    }

    #[test]
    fn test_malformed_quota_reports_error_and_fails_closed() {
        let (gate, sync) = sync();
        let result = sync.apply(&QuotaReport::new("lots"));
        assert!(matches!(result, Err(GatewayError::Quota(_))));

        let limiter = gate.route_limiter(&order_route()).unwrap();
        assert_eq!(limiter.burst(), 1.0);
    }

    #[test]
    fn test_stale_report_skipped() {
        let (gate, sync) = sync();
        sync.apply(&QuotaReport::new("100").with_ts("1700000000100")).unwrap();
        let skipped = sync.apply(&QuotaReport::new("5").with_ts("1700000000000")).unwrap();

        assert!(skipped.is_none());
        assert_eq!(gate.route_limiter(&order_route()).unwrap().burst(), 100.0);
    }

    #[test]
    fn test_report_from_response() {
        let body = json!({
            "code": "0",
            "msg": "",
            "data": [{
                "accRateLimit": "2000",
                "fillRatio": "0.1234",
                "nextAccRateLimit": "",
                "ts": "1695190491421"
            }]
        });
        let report = QuotaReport::from_response(&body).unwrap();
        assert_eq!(report.acc_rate_limit.as_deref(), Some("2000"));
        assert_eq!(report.next_acc_rate_limit.as_deref(), Some(""));

        let numeric = json!({ "accRateLimit": 30 });
        assert_eq!(
            QuotaReport::from_response(&numeric).unwrap().acc_rate_limit.as_deref(),
            Some("30")
        );

        assert!(QuotaReport::from_response(&json!({ "data": [{ "ordId": "1" }] })).is_none());
    }

    #[test]
    fn test_governs() {
        let (_, sync) = sync();
        assert!(sync.governs(&order_route()));
        assert!(sync.governs(&RouteKey::stream_op("batch-amend-orders")));
        assert!(!sync.governs(&RouteKey::rest(&Method::GET, "/api/v5/account/balance")));

        let quota_endpoint = RouteKey::rest(&Method::GET, ACCOUNT_RATE_LIMIT_PATH);
        assert!(!sync.governs(&quota_endpoint));
        assert!(sync.accepts_reports_from(&quota_endpoint));
        assert!(sync.accepts_reports_from(&order_route()));
        let balance = RouteKey::rest(&Method::GET, "/api/v5/account/balance");
        assert!(!sync.accepts_reports_from(&balance));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_quota_still_admits() {
        let (gate, sync) = sync();
        let quota = sync.apply(&QuotaReport::new("0.5")).unwrap().unwrap();

        assert!(!quota.minimal);
        assert_eq!(quota.burst, 1.0);
        assert_eq!(quota.rate, 0.25);

        let cancel = tokio_util::sync::CancellationToken::new();
        let key = RouteKey::stream_op("order");
        gate.acquire_route(&cancel, &key).await.unwrap();

        // 두 번째 토큰은 4초 뒤 보충
        let second = gate.acquire_route(&cancel, &key);
        assert!(tokio::time::timeout(Duration::from_secs(5), second).await.is_ok());
    }

    #[test]
    fn test_repeated_report_keeps_drained_bucket() {
        let (gate, sync) = sync();
        sync.apply(&QuotaReport::new("0")).unwrap();
        let limiter = gate.route_limiter(&order_route()).unwrap();
        assert!(limiter.try_acquire());

        // 같은 쿼터가 다시 보고되어도 토큰이 새로 생기지 않음
        sync.apply(&QuotaReport::new("0")).unwrap();
        let again = gate.route_limiter(&order_route()).unwrap();
        assert!(Arc::ptr_eq(&limiter, &again));
        assert!(!again.try_acquire());
    }
}
