//! 자격증명 및 요청 서명.
//!
//! 게이트웨이는 서명 방식에 의존하지 않고 두 트레이트만 사용합니다:
//! - [`RequestSigner`]: REST 요청 헤더 생성
//! - [`Authenticator`]: 스트림 로그인 프레임 인자 생성
//!
//! [`HmacCredentials`]는 두 트레이트의 HMAC-SHA256 구현입니다.
//! 서명 = `base64(HMAC-SHA256(secret, timestamp + METHOD + path + body))`

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// 스트림 로그인 서명 경로.
const LOGIN_VERIFY_PATH: &str = "/users/self/verify";

/// REST 요청 서명.
pub trait RequestSigner: Send + Sync {
    /// 요청에 추가할 인증 헤더 목록.
    fn sign_headers(&self, method: &str, path: &str, body: &str)
        -> GatewayResult<Vec<(String, String)>>;
}

/// 스트림 로그인 인자 생성.
pub trait Authenticator: Send + Sync {
    /// `{"op":"login","args":[..]}`의 인자 객체.
    fn login_args(&self) -> GatewayResult<Value>;
}

/// API 키 기반 HMAC 자격증명.
///
/// # 보안
/// - `Debug` 구현은 `api_key`를 일부만 보여주고 `secret`, `passphrase`는 마스킹합니다.
#[derive(Clone)]
pub struct HmacCredentials {
    api_key: String,
    secret: SecretString,
    passphrase: SecretString,
}

impl fmt::Debug for HmacCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars: Vec<char> = self.api_key.chars().collect();
        let masked_key = if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        } else {
            "***REDACTED***".to_string()
        };

        f.debug_struct("HmacCredentials")
            .field("api_key", &masked_key)
            .field("secret", &"***REDACTED***")
            .field("passphrase", &"***REDACTED***")
            .finish()
    }
}

impl HmacCredentials {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: SecretString::from(secret.into()),
            passphrase: SecretString::from(passphrase.into()),
        }
    }

    /// 환경 변수(`VENUE_API_KEY`, `VENUE_API_SECRET`, `VENUE_API_PASSPHRASE`)에서 생성.
    pub fn from_env() -> Option<Self> {
        Some(Self::new(
            std::env::var("VENUE_API_KEY").ok()?,
            std::env::var("VENUE_API_SECRET").ok()?,
            std::env::var("VENUE_API_PASSPHRASE").ok()?,
        ))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// 주어진 타임스탬프로 서명 계산.
    pub fn sign_at(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> GatewayResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid signing key: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.to_ascii_uppercase().as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// 로그인 인자 계산 (초 단위 타임스탬프).
    pub fn login_args_at(&self, timestamp_secs: i64) -> GatewayResult<Value> {
        let timestamp = timestamp_secs.to_string();
        let sign = self.sign_at(&timestamp, "GET", LOGIN_VERIFY_PATH, "")?;
        Ok(json!({
            "apiKey": self.api_key,
            "passphrase": self.passphrase.expose_secret(),
            "timestamp": timestamp,
            "sign": sign,
        }))
    }
}

impl RequestSigner for HmacCredentials {
    fn sign_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> GatewayResult<Vec<(String, String)>> {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let sign = self.sign_at(&timestamp, method, path, body)?;
        Ok(vec![
            ("OK-ACCESS-KEY".to_string(), self.api_key.clone()),
            ("OK-ACCESS-SIGN".to_string(), sign),
            ("OK-ACCESS-TIMESTAMP".to_string(), timestamp),
            (
                "OK-ACCESS-PASSPHRASE".to_string(),
                self.passphrase.expose_secret().to_string(),
            ),
        ])
    }
}

impl Authenticator for HmacCredentials {
    fn login_args(&self) -> GatewayResult<Value> {
        self.login_args_at(Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let creds = HmacCredentials::new("key", "Jefe", "pass");
        let sign = creds.sign_at("what do ya want for nothing?", "", "", "").unwrap();
        assert_eq!(sign, "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM=");
    }

    #[test]
    fn test_login_args() {
        let creds = HmacCredentials::new("my-api-key", "secret", "phrase");
        let args = creds.login_args_at(1538054050).unwrap();
        assert_eq!(args["apiKey"], "my-api-key");
        assert_eq!(args["passphrase"], "phrase");
        assert_eq!(args["timestamp"], "1538054050");
        assert_eq!(args["sign"], "Gj2hQIVKFcXbiwCak8SmVOu5mxPCizWDdmUAhbx8Z+s=");
    }

    #[test]
    fn test_sign_headers_present() {
        let creds = HmacCredentials::new("my-api-key", "secret", "phrase");
        let headers = creds.sign_headers("post", "/api/v5/trade/order", "{}").unwrap();
        let names: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["OK-ACCESS-KEY", "OK-ACCESS-SIGN", "OK-ACCESS-TIMESTAMP", "OK-ACCESS-PASSPHRASE"]
        );
    }

    #[test]
    fn test_debug_masks_secrets() {
        let creds = HmacCredentials::new("abcd1234efgh5678", "top-secret", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("abcd...5678"));
        assert!(!debug.contains("top-secret"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_debug_mask_handles_multibyte_key() {
        let creds = HmacCredentials::new("키키키키값값값값값", "s", "p");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("키키키키...값값값값"));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("VENUE_API_KEY", "env-api-key-0001");
        std::env::set_var("VENUE_API_SECRET", "env-secret");
        std::env::remove_var("VENUE_API_PASSPHRASE");
        assert!(HmacCredentials::from_env().is_none());

        std::env::set_var("VENUE_API_PASSPHRASE", "env-phrase");
        let creds = HmacCredentials::from_env().unwrap();
        assert_eq!(creds.api_key(), "env-api-key-0001");

        for name in ["VENUE_API_KEY", "VENUE_API_SECRET", "VENUE_API_PASSPHRASE"] {
            std::env::remove_var(name);
        }
    }
}
