//! 통합 테스트용 인프로세스 WebSocket 거래소.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// 모의 거래소 응답 동작.
#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    /// 로그인 수락 여부
    pub accept_login: bool,
    /// 구독 요청 자동 확인
    pub ack_subscriptions: bool,
    /// 오퍼레이션 자동 응답
    pub reply_ops: bool,
    /// `ping`에 `pong` 응답
    pub respond_pong: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            accept_login: true,
            ack_subscriptions: true,
            reply_ops: true,
            respond_pong: true,
        }
    }
}

/// 서버가 받은 프레임.
#[derive(Debug, Clone)]
pub struct Received {
    /// 연결 순번 (0부터)
    pub conn: usize,
    pub text: String,
    pub value: Option<Value>,
}

impl Received {
    pub fn op(&self) -> Option<&str> {
        self.value.as_ref()?.get("op")?.as_str()
    }

    /// 구독 프레임의 `instId` 목록.
    pub fn inst_ids(&self) -> Vec<String> {
        self.value
            .as_ref()
            .and_then(|v| v.get("args"))
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(|a| a.get("instId").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

enum Outbound {
    Frame(Message),
    Close,
}

type Connections = Arc<Mutex<Vec<mpsc::UnboundedSender<Outbound>>>>;

pub struct MockVenue {
    addr: SocketAddr,
    inbox: mpsc::UnboundedReceiver<Received>,
    connections: Connections,
    handle: JoinHandle<()>,
}

impl MockVenue {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let connections: Connections = Arc::new(Mutex::new(Vec::new()));

        let registry = connections.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let conn = {
                    let mut conns = registry.lock().unwrap();
                    conns.push(out_tx.clone());
                    conns.len() - 1
                };
                tokio::spawn(handle_socket(
                    stream,
                    conn,
                    behavior,
                    inbox_tx.clone(),
                    out_tx,
                    out_rx,
                ));
            }
        });

        Self {
            addr,
            inbox,
            connections,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// 조건에 맞는 다음 수신 프레임 (5초 안에 없으면 실패).
    pub async fn next_matching<F>(&mut self, pred: F) -> Received
    where
        F: Fn(&Received) -> bool,
    {
        let wait = async {
            loop {
                let received = self.inbox.recv().await.expect("mock venue stopped");
                if pred(&received) {
                    return received;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for frame")
    }

    /// 특정 연결로 텍스트 전송.
    pub fn send(&self, conn: usize, text: impl Into<String>) {
        let conns = self.connections.lock().unwrap();
        let _ = conns[conn].send(Outbound::Frame(Message::Text(text.into())));
    }

    /// 특정 연결 끊기.
    pub fn drop_connection(&self, conn: usize) {
        let conns = self.connections.lock().unwrap();
        let _ = conns[conn].send(Outbound::Close);
    }
}

impl Drop for MockVenue {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_socket(
    stream: TcpStream,
    conn: usize,
    behavior: Behavior,
    inbox: mpsc::UnboundedSender<Received>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Frame(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(msg)) = source.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let text = text.to_string();
        let value: Option<Value> = serde_json::from_str(&text).ok();
        let _ = inbox.send(Received {
            conn,
            text: text.clone(),
            value: value.clone(),
        });

        for reply in respond(&behavior, &text, value.as_ref()) {
            let _ = out_tx.send(Outbound::Frame(Message::Text(reply)));
        }
    }

    writer.abort();
}

fn respond(behavior: &Behavior, text: &str, value: Option<&Value>) -> Vec<String> {
    if text == "ping" {
        return if behavior.respond_pong {
            vec!["pong".to_string()]
        } else {
            Vec::new()
        };
    }
    let Some(value) = value else {
        return Vec::new();
    };
    let op = value.get("op").and_then(Value::as_str).unwrap_or_default();
    let args = value
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    match op {
        "login" if behavior.accept_login => {
            vec![json!({ "event": "login", "code": "0", "msg": "" }).to_string()]
        }
        "login" => {
            vec![json!({ "event": "error", "code": "60009", "msg": "Login failed." }).to_string()]
        }
        "subscribe" | "unsubscribe" if behavior.ack_subscriptions => args
            .iter()
            .map(|arg| json!({ "event": op, "arg": arg }).to_string())
            .collect(),
        "subscribe" | "unsubscribe" => Vec::new(),
        _ if behavior.reply_ops && value.get("id").is_some() => {
            let id = value["id"].clone();
            let code = if op == "fail-op" { "51000" } else { "0" };
            vec![json!({
                "id": id,
                "op": op,
                "code": code,
                "msg": if code == "0" { "" } else { "Parameter error" },
                "data": [{ "echo": args }],
            })
            .to_string()]
        }
        _ => Vec::new(),
    }
}
