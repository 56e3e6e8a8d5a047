//! 스트림 프레임 인코딩 및 수신 프레임 분류.
//!
//! 요청: `{"op":"subscribe","args":[{"channel":"tickers","instId":"BTC-USDT"}]}`
//! 응답/이벤트: `{"event":"subscribe","arg":{..}}`, `{"event":"error","code":..,"msg":..}`,
//! `{"event":"login","code":"0"}`, 데이터 `{"arg":{..},"data":[..]}`,
//! 오퍼레이션 응답 `{"id":..,"op":..,"code":..,"msg":..,"data":[..]}`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{GatewayError, GatewayResult};

/// 하트비트 요청 텍스트.
pub const PING: &str = "ping";

/// 하트비트 응답 텍스트.
pub const PONG: &str = "pong";

/// 구독 토픽.
///
/// 채널명과 파라미터 맵으로 식별되며, 파라미터는 정렬 맵이므로
/// 같은 내용이면 입력 순서와 무관하게 같은 토픽입니다.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic {
    /// 채널명 (예: `tickers`, `books5`)
    pub channel: String,
    /// 채널 파라미터 (예: `instId`)
    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
}

impl Topic {
    /// 파라미터 없는 토픽 생성.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            params: BTreeMap::new(),
        }
    }

    /// 단일 상품 토픽 (`instId`).
    pub fn instrument(channel: impl Into<String>, inst_id: impl Into<String>) -> Self {
        Self::new(channel).with_param("instId", inst_id)
    }

    /// 파라미터 추가.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// 수신 프레임의 `arg` 객체에서 토픽 추출.
    ///
    /// 문자열이 아닌 파라미터 값은 JSON 표기로 변환됩니다.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let channel = obj.get("channel")?.as_str()?.to_string();
        let params = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "channel")
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect();
        Some(Self { channel, params })
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("channel".to_string(), Value::String(self.channel.clone()));
        for (k, v) in &self.params {
            obj.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(obj)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel)?;
        for (k, v) in &self.params {
            write!(f, ":{}={}", k, v)?;
        }
        Ok(())
    }
}

/// 구독 요청 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    /// 프레임의 `op` 값.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionOp::Subscribe => "subscribe",
            SubscriptionOp::Unsubscribe => "unsubscribe",
        }
    }
}

/// 구독/해제 프레임.
pub fn subscription_frame(op: SubscriptionOp, topics: &[Topic]) -> String {
    let args: Vec<Value> = topics.iter().map(Topic::to_value).collect();
    json!({ "op": op.as_str(), "args": args }).to_string()
}

/// 로그인 프레임.
pub fn login_frame(args: Value) -> String {
    json!({ "op": "login", "args": [args] }).to_string()
}

/// 상관 ID를 가진 오퍼레이션 프레임. 배열이 아닌 `args`는 단일 원소 배열로 감쌉니다.
pub fn op_frame(id: &str, op: &str, args: Value) -> String {
    let args = match args {
        Value::Array(items) => Value::Array(items),
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other]),
    };
    json!({ "id": id, "op": op, "args": args }).to_string()
}

/// 오퍼레이션 응답.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub id: String,
    pub op: String,
    pub code: String,
    pub msg: String,
    pub data: Vec<Value>,
    /// 원본 프레임 텍스트
    pub raw: String,
}

impl OpReply {
    /// 성공 응답인지 확인 (`code == "0"`).
    pub fn is_success(&self) -> bool {
        self.code == "0"
    }

    /// 실패 응답을 에러로 변환.
    pub fn into_result(self) -> GatewayResult<OpReply> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(GatewayError::Op {
                op: self.op,
                code: self.code,
                message: self.msg,
            })
        }
    }
}

/// 토픽 데이터 메시지 (typed 큐 항목).
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub topic: Topic,
    /// `snapshot` / `update` 등 (채널에 따라 없음)
    pub action: Option<String>,
    pub data: Value,
}

/// 원본 텍스트 메시지 (raw 큐 항목).
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// 분류된 수신 프레임.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// 하트비트 응답
    Pong,
    /// 로그인 응답
    Login { code: String, msg: String },
    /// 구독 확인
    Subscribed(Topic),
    /// 구독 해제 확인
    Unsubscribed(Topic),
    /// 에러 이벤트 (`arg`가 있으면 해당 토픽에 대한 에러)
    Error {
        code: String,
        msg: String,
        topic: Option<Topic>,
    },
    /// 오퍼레이션 응답
    OpReply(OpReply),
    /// 토픽 데이터
    Data(DataMessage),
    /// 기타 이벤트 (`notice`, `channel-conn-count` 등)
    Event { event: String, payload: Value },
    /// 분류할 수 없는 JSON
    Unknown(Value),
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// 수신 텍스트 프레임을 분류합니다.
pub fn classify(text: &str) -> GatewayResult<InboundFrame> {
    let trimmed = text.trim();
    if trimmed == PONG {
        return Ok(InboundFrame::Pong);
    }

    let value: Value = serde_json::from_str(trimmed)?;
    let Some(obj) = value.as_object() else {
        return Ok(InboundFrame::Unknown(value));
    };

    if let Some(event) = obj.get("event").and_then(Value::as_str) {
        let topic = obj.get("arg").and_then(Topic::from_value);
        return Ok(match event {
            "login" => InboundFrame::Login {
                code: str_field(obj, "code"),
                msg: str_field(obj, "msg"),
            },
            "subscribe" => match topic {
                Some(topic) => InboundFrame::Subscribed(topic),
                None => {
                    return Err(GatewayError::Protocol(format!(
                        "subscribe ack without arg: {}",
                        trimmed
                    )))
                }
            },
            "unsubscribe" => match topic {
                Some(topic) => InboundFrame::Unsubscribed(topic),
                None => {
                    return Err(GatewayError::Protocol(format!(
                        "unsubscribe ack without arg: {}",
                        trimmed
                    )))
                }
            },
            "error" => InboundFrame::Error {
                code: str_field(obj, "code"),
                msg: str_field(obj, "msg"),
                topic,
            },
            other => InboundFrame::Event {
                event: other.to_string(),
                payload: value.clone(),
            },
        });
    }

    if obj.contains_key("id") && obj.contains_key("op") {
        let data = match obj.get("data") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        return Ok(InboundFrame::OpReply(OpReply {
            id: str_field(obj, "id"),
            op: str_field(obj, "op"),
            code: str_field(obj, "code"),
            msg: str_field(obj, "msg"),
            data,
            raw: trimmed.to_string(),
        }));
    }

    if let (Some(arg), Some(data)) = (obj.get("arg"), obj.get("data")) {
        if let Some(topic) = Topic::from_value(arg) {
            return Ok(InboundFrame::Data(DataMessage {
                topic,
                action: obj.get("action").and_then(Value::as_str).map(str::to_string),
                data: data.clone(),
            }));
        }
    }

    Ok(InboundFrame::Unknown(value))
}
