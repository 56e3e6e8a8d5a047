//! 요청 게이트를 거치는 REST 클라이언트.
//!
//! 모든 호출은 [`RequestGate`] 승인 → 서명 → 전송 → 응답 본문 수신 후 반납 순서로 진행됩니다.
//! 쿼터를 보고하는 라우트(주문 계열과 쿼터 조회 엔드포인트)의 응답은
//! [`QuotaSync`]로 넘겨 라우트 한도기를 재설정합니다.

use std::sync::Arc;

use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use venue_core::RestConfig;

use crate::auth::RequestSigner;
use crate::ratelimit::{QuotaSync, RequestGate, RouteKey};
use crate::{GatewayError, GatewayResult};

/// 거래소 REST 클라이언트.
pub struct RestClient {
    http: Client,
    base_url: String,
    gate: Arc<RequestGate>,
    signer: Option<Arc<dyn RequestSigner>>,
    quota: Option<QuotaSync>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("signed", &self.signer.is_some())
            .field("quota_sync", &self.quota.is_some())
            .finish()
    }
}

impl RestClient {
    pub fn new(config: RestConfig, gate: Arc<RequestGate>) -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            gate,
            signer: None,
            quota: None,
        })
    }

    /// 요청 서명기 설정.
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// 쿼터 동기화기 설정.
    pub fn with_quota_sync(mut self, quota: QuotaSync) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    /// GET 요청.
    pub async fn get<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        query: &[(&str, &str)],
    ) -> GatewayResult<T> {
        self.request::<T, Value>(cancel, Method::GET, path, query, None).await
    }

    /// JSON 본문 POST 요청.
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: &B,
    ) -> GatewayResult<T> {
        self.request(cancel, Method::POST, path, &[], Some(body)).await
    }

    /// 요청을 보내고 `{code,msg,data}` 응답의 `data`를 역직렬화합니다.
    ///
    /// `code`가 `"0"`이 아니면 [`GatewayError::Api`]를 반환합니다.
    pub async fn request<T, B>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> GatewayResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| GatewayError::Config(format!("invalid url for {}: {}", path, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let request_path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let body = match body {
            Some(body) => serde_json::to_string(body)?,
            None => String::new(),
        };

        let route = RouteKey::rest(&method, path);
        let mut permit = self.gate.acquire_route(cancel, &route).await?;

        let mut builder = self
            .http
            .request(method.clone(), url)
            .header("Content-Type", "application/json");
        if let Some(signer) = &self.signer {
            for (name, value) in signer.sign_headers(method.as_str(), &request_path, &body)? {
                builder = builder.header(name, value);
            }
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        debug!(route = %route, "Sending REST request");
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, GatewayError>((status, text))
        };
        let (status, text) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(GatewayError::Cancelled(format!("{} in flight", route)));
            }
            result = exchange => result?,
        };
        permit.release();

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                GatewayError::Parse(format!("{}: {}", route, e))
            } else {
                GatewayError::Api {
                    code: status.as_u16().to_string(),
                    message: text.clone(),
                }
            }
        })?;

        if let Some(quota) = self.quota.as_ref().filter(|q| q.accepts_reports_from(&route)) {
            if let Err(e) = quota.apply_from_response(&value) {
                warn!(route = %route, error = %e, "Quota sync failed");
            }
        }

        decode_envelope(status.as_u16(), value)
    }
}

fn code_of(value: &Value) -> Option<String> {
    match value.get("code")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn decode_envelope<T: DeserializeOwned>(status: u16, mut value: Value) -> GatewayResult<T> {
    let message = value
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match code_of(&value) {
        Some(code) if code != "0" => return Err(GatewayError::Api { code, message }),
        None if !(200..300).contains(&status) => {
            return Err(GatewayError::Api {
                code: status.to_string(),
                message: value.to_string(),
            })
        }
        _ => {}
    }

    let payload = match value.get_mut("data").map(Value::take) {
        Some(data) => data,
        None => value,
    };
    Ok(serde_json::from_value(payload)?)
}
