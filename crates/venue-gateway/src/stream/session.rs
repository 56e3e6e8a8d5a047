//! 스트리밍 세션: 단일 WebSocket 연결의 수명 관리.
//!
//! 세션마다 제어 태스크 하나가 소켓을 단독으로 소유하고
//! `연결 → (로그인) → 구독 재조정 → 수신 루프 → 해제 → 백오프` 를 반복합니다.
//!
//! 호출자는 [`StreamSession`] 핸들로 구독 집합을 바꾸고 오퍼레이션을 보냅니다.
//! 모든 요청은 명령 채널을 통해 제어 태스크로 전달되므로 소켓에 직접 접근하지 않습니다.
//! 마지막 핸들이 drop되면 `stop()`과 같은 종료가 시작됩니다 (태스크 종료는 기다리지 않음).
//!
//! # 사용 예제
//!
//! ```rust,ignore
//! let session = StreamSession::new(StreamConfig::default(), None)?;
//! session.subscribe([Topic::instrument("tickers", "BTC-USDT")])?;
//! session.start()?;
//!
//! let queue = session.typed_messages();
//! while let Ok(msg) = queue.recv().await {
//!     println!("{}: {}", msg.topic, msg.data);
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use venue_core::StreamConfig;

use super::correlator::OpCorrelator;
use super::dispatch::DispatchQueue;
use super::frame::{
    classify, login_frame, op_frame, subscription_frame, DataMessage, InboundFrame, OpReply,
    RawMessage, SubscriptionOp, Topic, PING,
};
use super::reconcile::{chunk_topics, LiveSubscriptions};
use super::state::{Backoff, SessionState};
use super::stats::{Gauges, LastError, QueueStats, SessionCounters, SessionStats};
use crate::auth::Authenticator;
use crate::ratelimit::{RequestGate, RouteKey};
use crate::{GatewayError, GatewayResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// 연결 종료 프레임 전송 대기 한도.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 제어 태스크로 전달되는 명령.
#[derive(Debug)]
enum Command {
    /// 희망 구독 집합이 바뀜
    Reconcile,
    /// 상관 ID가 붙은 오퍼레이션 프레임 (발급 시점의 연결 세대 포함)
    Op { epoch: u64, id: String, text: String },
}

#[derive(Debug, Default)]
struct Liveness {
    last_recv_at: Option<DateTime<Utc>>,
    last_ping_at: Option<DateTime<Utc>>,
    last_pong_at: Option<DateTime<Utc>>,
}

struct Inner {
    config: StreamConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    gate: RwLock<Option<Arc<RequestGate>>>,
    desired: Mutex<BTreeSet<Topic>>,
    correlator: Arc<OpCorrelator>,
    typed: DispatchQueue<DataMessage>,
    raw: Option<DispatchQueue<RawMessage>>,
    counters: SessionCounters,
    liveness: Mutex<Liveness>,
    last_error: Mutex<Option<LastError>>,
    backoff_ms: AtomicU64,
    epoch: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// 사용자 핸들 수명 표식. 마지막 복제본이 drop되면 세션을 종료합니다.
///
/// 제어 태스크는 `Inner`만 보유하므로 이 표식의 수명에 영향을 주지 않습니다.
struct HandleGuard {
    inner: Arc<Inner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.inner.cancel.is_cancelled() {
            let woken = self.inner.begin_shutdown();
            debug!(woken_waiters = woken, "Last stream session handle dropped, shutting down");
        }
    }
}

/// 스트리밍 세션 핸들. 복제본은 같은 세션을 가리킵니다.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<Inner>,
    _guard: Arc<HandleGuard>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl StreamSession {
    /// 새 세션 생성. [`start`](Self::start)를 호출하기 전에는 연결하지 않습니다.
    ///
    /// 설정이 유효하지 않으면 [`GatewayError::Config`]를 반환합니다.
    pub fn new(
        config: StreamConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> GatewayResult<Self> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let typed = DispatchQueue::new(config.typed_queue_capacity, config.overflow);
        let raw = (config.raw_queue_capacity > 0)
            .then(|| DispatchQueue::new(config.raw_queue_capacity, config.overflow));
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let backoff_ms = config.backoff_min_ms;

        let inner = Arc::new(Inner {
            config,
            authenticator,
            gate: RwLock::new(None),
            desired: Mutex::new(BTreeSet::new()),
            correlator: Arc::new(OpCorrelator::new()),
            typed,
            raw,
            counters: SessionCounters::default(),
            liveness: Mutex::new(Liveness::default()),
            last_error: Mutex::new(None),
            backoff_ms: AtomicU64::new(backoff_ms),
            epoch: AtomicU64::new(0),
            state_tx,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        Ok(Self {
            _guard: Arc::new(HandleGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        })
    }

    /// 스트림 오퍼레이션을 라우트별 한도기로 제한합니다 (`RouteKey::stream_op(op)`).
    pub fn with_gate(self, gate: Arc<RequestGate>) -> Self {
        *self.inner.gate.write().unwrap_or_else(|e| e.into_inner()) = Some(gate);
        self
    }

    /// 제어 태스크 시작. 이미 시작되었으면 아무것도 하지 않습니다.
    pub fn start(&self) -> GatewayResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(GatewayError::Stopped);
        }
        let Some(commands) = lock(&self.inner.cmd_rx).take() else {
            return Ok(());
        };

        info!(url = %self.inner.config.url, "Starting stream session");
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(commands).await });
        *lock(&self.inner.task) = Some(handle);
        Ok(())
    }

    /// 세션 종료 (종단).
    ///
    /// 진행 중인 연결/읽기/쓰기를 취소하고, 대기 중인 오퍼레이션과
    /// 큐 소비자를 모두 취소 에러로 깨운 뒤 제어 태스크 종료를 기다립니다.
    pub async fn stop(&self) {
        let woken = self.inner.begin_shutdown();

        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Stream session task ended abnormally");
            }
        }
        self.inner.set_state(SessionState::Stopped);
        info!(woken_waiters = woken, "Stream session stopped");
    }

    /// 현재 상태.
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// 상태 변경 구독.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Ready 상태가 될 때까지 대기.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> GatewayResult<()> {
        let mut rx = self.subscribe_state();
        let wait = rx.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Stopped));

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled("wait ready".to_string())),
            result = wait => match result {
                Ok(state) if *state == SessionState::Ready => Ok(()),
                _ => Err(GatewayError::Stopped),
            },
        }
    }

    /// 현재 연결 세대. Ready 진입마다 1씩 증가합니다.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    /// 토픽을 희망 구독 집합에 추가합니다. 네트워크 확인을 기다리지 않습니다.
    pub fn subscribe<I>(&self, topics: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = Topic>,
    {
        let changed = {
            let mut desired = lock(&self.inner.desired);
            topics
                .into_iter()
                .fold(false, |changed, topic| desired.insert(topic) || changed)
        };
        self.notify_reconcile(changed)
    }

    /// 토픽을 희망 구독 집합에서 제거합니다.
    pub fn unsubscribe<I>(&self, topics: I) -> GatewayResult<()>
    where
        I: IntoIterator<Item = Topic>,
    {
        let changed = {
            let mut desired = lock(&self.inner.desired);
            topics
                .into_iter()
                .fold(false, |changed, topic| desired.remove(&topic) || changed)
        };
        self.notify_reconcile(changed)
    }

    fn notify_reconcile(&self, changed: bool) -> GatewayResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(GatewayError::Stopped);
        }
        if changed {
            // 수신측은 세션이 살아 있는 동안 닫히지 않음
            let _ = self.inner.cmd_tx.send(Command::Reconcile);
        }
        Ok(())
    }

    /// 희망 구독 집합 스냅샷.
    pub fn desired_subscriptions(&self) -> Vec<Topic> {
        lock(&self.inner.desired).iter().cloned().collect()
    }

    /// 오퍼레이션을 보내고 상관된 응답을 기다립니다.
    ///
    /// 응답 `code`가 `"0"`이 아니면 [`GatewayError::Op`]를 반환합니다.
    /// 대기 중 연결이 끊기면 [`GatewayError::Disconnected`],
    /// 세션이 종료되거나 `cancel`이 취소되면 [`GatewayError::Cancelled`]를 반환합니다.
    pub async fn do_op_and_wait(
        &self,
        cancel: &CancellationToken,
        op: &str,
        args: Value,
    ) -> GatewayResult<OpReply> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(GatewayError::NotReady(format!("session is {}", state)));
        }

        let gate = self
            .inner
            .gate
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let permit = match gate {
            Some(gate) => Some(gate.acquire_route(cancel, &RouteKey::stream_op(op)).await?),
            None => None,
        };

        let epoch = self.epoch();
        let waiter = self.inner.correlator.register()?;
        let id = waiter.id().to_string();
        let text = op_frame(&id, op, args);

        self.inner
            .cmd_tx
            .send(Command::Op { epoch, id, text })
            .map_err(|_| GatewayError::Stopped)?;
        drop(permit);

        waiter.wait(cancel).await?.into_result()
    }

    /// typed 메시지 큐 핸들.
    pub fn typed_messages(&self) -> DispatchQueue<DataMessage> {
        self.inner.typed.clone()
    }

    /// raw 메시지 큐 핸들 (`raw_queue_capacity = 0`이면 `None`).
    pub fn raw_messages(&self) -> Option<DispatchQueue<RawMessage>> {
        self.inner.raw.clone()
    }

    /// 관측용 스냅샷.
    pub fn stats(&self) -> SessionStats {
        self.inner.stats()
    }
}

fn queue_stats<T>(queue: &DispatchQueue<T>) -> QueueStats {
    QueueStats {
        len: queue.len(),
        capacity: queue.capacity(),
        dropped: queue.dropped(),
    }
}

impl Inner {
    /// 대기자와 큐 소비자를 깨우고 제어 태스크 취소를 요청합니다.
    fn begin_shutdown(&self) -> usize {
        let woken = self
            .correlator
            .close(GatewayError::Cancelled("session stopped".to_string()));
        self.cancel.cancel();
        self.typed.close();
        if let Some(raw) = &self.raw {
            raw.close();
        }
        woken
    }

    fn set_state(&self, next: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next || current.is_terminal() {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "Unexpected session state transition");
            }
            debug!(from = %current, to = %next, "Session state changed");
            *current = next;
            true
        });
    }

    fn record_error(&self, err: &GatewayError) {
        *lock(&self.last_error) = Some(LastError {
            message: err.to_string(),
            at: Utc::now(),
        });
    }

    fn stats(&self) -> SessionStats {
        let liveness = {
            let l = lock(&self.liveness);
            (l.last_recv_at, l.last_ping_at, l.last_pong_at)
        };
        let gauges = Gauges {
            state: *self.state_tx.borrow(),
            desired_subscriptions: lock(&self.desired).len(),
            pending_ops: self.correlator.pending(),
            typed_queue: queue_stats(&self.typed),
            raw_queue: self.raw.as_ref().map(queue_stats),
            backoff: Duration::from_millis(self.backoff_ms.load(Ordering::Relaxed)),
            last_recv_at: liveness.0,
            last_ping_at: liveness.1,
            last_pong_at: liveness.2,
            last_error: lock(&self.last_error).clone(),
        };
        SessionStats::capture(&self.counters, gauges)
    }

    /// 제어 루프.
    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut backoff = Backoff::new(
            self.config.backoff_min(),
            self.config.backoff_max(),
            self.config.backoff_jitter(),
        );

        'session: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let reason = self.run_connection(&mut commands, &mut backoff).await;

            // 연결 단위 상태 정리: 대기자 실패 처리 (구독 상태는 run_connection과 함께 폐기됨)
            let failed = self
                .correlator
                .fail_all(GatewayError::Disconnected(reason.to_string()));
            self.set_state(SessionState::Disconnected);

            if self.cancel.is_cancelled() || reason.is_cancellation() {
                break;
            }

            self.record_error(&reason);
            let delay = backoff.next_delay();
            self.backoff_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
            warn!(
                error = %reason,
                failed_ops = failed,
                backoff_ms = delay.as_millis() as u64,
                "Stream connection lost, reconnecting after backoff"
            );

            self.set_state(SessionState::Backoff);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'session,
                    _ = &mut sleep => break,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.reject_offline(cmd),
                        None => break 'session,
                    },
                }
            }
        }

        self.set_state(SessionState::Stopped);
        debug!("Stream session control loop exited");
    }

    /// 연결이 없을 때 도착한 명령 처리.
    fn reject_offline(&self, cmd: Command) {
        match cmd {
            // 다음 연결의 전체 재조정에 반영됨
            Command::Reconcile => {}
            Command::Op { id, .. } => {
                self.correlator.resolve(
                    &id,
                    Err(GatewayError::Disconnected("no active connection".to_string())),
                );
            }
        }
    }

    async fn dial(&self) -> GatewayResult<WsStream> {
        self.set_state(SessionState::Dialing);
        SessionCounters::incr(&self.counters.dial_attempts);
        debug!(url = %self.config.url, "Dialing stream endpoint");

        let connect = tokio::time::timeout(
            self.config.dial_timeout(),
            connect_async(self.config.url.as_str()),
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled("dial".to_string())),
            result = connect => match result {
                Err(_) => Err(GatewayError::Timeout(format!(
                    "dial exceeded {}ms",
                    self.config.dial_timeout_ms
                ))),
                Ok(Err(e)) => Err(GatewayError::from(e)),
                Ok(Ok((ws, _response))) => Ok(ws),
            },
        }
    }

    /// 연결 하나의 수명. 연결이 끝난 이유를 반환합니다.
    async fn run_connection(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        backoff: &mut Backoff,
    ) -> GatewayError {
        let ws = match self.dial().await {
            Ok(ws) => ws,
            Err(e) => return e,
        };

        let previous = self.counters.connects.fetch_add(1, Ordering::Relaxed);
        if previous > 0 {
            SessionCounters::incr(&self.counters.reconnects);
        }
        self.set_state(SessionState::Connected);
        info!(url = %self.config.url, reconnect = previous > 0, "Stream connected");

        let (mut sink, mut source) = ws.split();
        let mut last_activity = Instant::now();

        if self.config.requires_login {
            if let Err(e) = self.authenticate(&mut sink, &mut source, &mut last_activity).await {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return e;
            }
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        let mut live = LiveSubscriptions::new();
        if let Err(e) = self.reconcile(&mut sink, &mut live).await {
            return e;
        }
        // 재조정까지 끝난 연결만 백오프를 초기화 (Ready 관측 시점에는 이미 반영됨)
        backoff.reset();
        self.backoff_ms
            .store(self.config.backoff_min_ms, Ordering::Relaxed);
        self.set_state(SessionState::Ready);
        info!(epoch, subscriptions = live.len(), "Stream session ready");

        let reason = self
            .read_loop(&mut sink, &mut source, &mut live, commands, epoch, last_activity)
            .await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        reason
    }

    async fn send_text(&self, sink: &mut WsSink, text: String) -> GatewayResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled("send".to_string())),
            result = sink.send(Message::Text(text.into())) => result.map_err(GatewayError::from),
        }
    }

    /// 로그인 프레임 전송 후 성공 응답 대기.
    async fn authenticate(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        last_activity: &mut Instant,
    ) -> GatewayResult<()> {
        self.set_state(SessionState::Authenticating);
        let authenticator = self.authenticator.as_ref().ok_or_else(|| {
            GatewayError::Unauthorized("login required but no authenticator configured".to_string())
        })?;
        let args = authenticator.login_args()?;
        self.send_text(sink, login_frame(args)).await?;

        let deadline = tokio::time::sleep(self.config.auth_timeout());
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(GatewayError::Cancelled("authentication".to_string()));
                }
                _ = &mut deadline => {
                    return Err(GatewayError::Timeout(format!(
                        "no login response within {}ms",
                        self.config.auth_timeout_ms
                    )));
                }
                message = source.next() => message,
            };

            let text = match message {
                None => return Err(GatewayError::Disconnected("closed during login".to_string())),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Close(_))) => {
                    return Err(GatewayError::Disconnected("closed during login".to_string()))
                }
                Some(Ok(_)) => {
                    *last_activity = Instant::now();
                    continue;
                }
            };
            *last_activity = Instant::now();

            match classify(&text)? {
                InboundFrame::Login { code, .. } if code == "0" => {
                    debug!("Stream login accepted");
                    return Ok(());
                }
                InboundFrame::Login { code, msg } | InboundFrame::Error { code, msg, .. } => {
                    return Err(GatewayError::Unauthorized(format!("code {}: {}", code, msg)));
                }
                other => debug!(frame = ?other, "Frame ignored while authenticating"),
            }
        }
    }

    /// 희망 집합과 현재 연결의 구독 상태 차이를 전송합니다.
    async fn reconcile(
        &self,
        sink: &mut WsSink,
        live: &mut LiveSubscriptions,
    ) -> GatewayResult<()> {
        let desired = lock(&self.desired).clone();
        let to_subscribe = live.to_subscribe(&desired);
        let to_unsubscribe = live.to_unsubscribe(&desired);

        for chunk in chunk_topics(&to_unsubscribe, self.config.max_topics_per_frame) {
            self.send_text(sink, subscription_frame(SubscriptionOp::Unsubscribe, &chunk))
                .await?;
            live.mark_unsubscribing(&chunk);
            SessionCounters::add(&self.counters.unsubscribe_attempts, chunk.len() as u64);
        }
        for chunk in chunk_topics(&to_subscribe, self.config.max_topics_per_frame) {
            self.send_text(sink, subscription_frame(SubscriptionOp::Subscribe, &chunk))
                .await?;
            live.mark_subscribing(&chunk);
            SessionCounters::add(&self.counters.subscribe_attempts, chunk.len() as u64);
        }

        if !to_subscribe.is_empty() || !to_unsubscribe.is_empty() {
            debug!(
                subscribe = to_subscribe.len(),
                unsubscribe = to_unsubscribe.len(),
                "Subscription delta sent"
            );
        }
        Ok(())
    }

    async fn read_loop(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        live: &mut LiveSubscriptions,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        epoch: u64,
        mut last_activity: Instant,
    ) -> GatewayError {
        let ping_every = self.config.ping_interval();
        let liveness = self.config.liveness_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stale_at = last_activity + liveness;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return GatewayError::Cancelled("session stopped".to_string());
                }
                _ = tokio::time::sleep_until(stale_at) => {
                    return GatewayError::Timeout(format!(
                        "no data or heartbeat within {}ms",
                        self.config.liveness_timeout_ms
                    ));
                }
                message = source.next() => {
                    let text = match message {
                        None => return GatewayError::Disconnected("stream ended".to_string()),
                        Some(Err(e)) => return e.into(),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = format!("closed by server: {:?}", frame);
                            return GatewayError::Disconnected(reason);
                        }
                        Some(Ok(Message::Text(text))) => text.to_string(),
                        Some(Ok(Message::Binary(bytes))) => {
                            String::from_utf8_lossy(&bytes).into_owned()
                        }
                        Some(Ok(_)) => {
                            // 프로토콜 수준 ping/pong
                            last_activity = Instant::now();
                            continue;
                        }
                    };
                    last_activity = Instant::now();
                    if let Err(e) = self.handle_text(text, live) {
                        return e;
                    }
                }
                cmd = commands.recv() => {
                    let result = match cmd {
                        None => return GatewayError::Stopped,
                        Some(Command::Reconcile) => self.reconcile(sink, live).await,
                        Some(Command::Op { epoch: issued, id, text }) => {
                            if issued != epoch {
                                self.correlator.resolve(
                                    &id,
                                    Err(GatewayError::Disconnected(format!(
                                        "op issued for connection {} but current is {}",
                                        issued, epoch
                                    ))),
                                );
                                Ok(())
                            } else {
                                SessionCounters::incr(&self.counters.ops_sent);
                                self.send_text(sink, text).await
                            }
                        }
                    };
                    if let Err(e) = result {
                        return e;
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = self.send_text(sink, PING.to_string()).await {
                        return e;
                    }
                    SessionCounters::incr(&self.counters.pings_sent);
                    lock(&self.liveness).last_ping_at = Some(Utc::now());
                }
            }
        }
    }

    /// 수신 텍스트 프레임 처리. 프로토콜 위반이면 에러를 반환합니다.
    fn handle_text(&self, text: String, live: &mut LiveSubscriptions) -> GatewayResult<()> {
        SessionCounters::incr(&self.counters.frames_received);
        let now = Utc::now();
        lock(&self.liveness).last_recv_at = Some(now);

        let frame = classify(&text).map_err(|e| match e {
            GatewayError::Parse(msg) => {
                GatewayError::Protocol(format!("unparsable frame: {}", msg))
            }
            other => other,
        })?;

        match frame {
            InboundFrame::Pong => {
                lock(&self.liveness).last_pong_at = Some(now);
            }
            InboundFrame::Subscribed(topic) => {
                live.ack_subscribe(&topic);
                SessionCounters::incr(&self.counters.subscribe_ok);
                debug!(topic = %topic, "Subscription acknowledged");
            }
            InboundFrame::Unsubscribed(topic) => {
                live.ack_unsubscribe(&topic);
                SessionCounters::incr(&self.counters.unsubscribe_ok);
                debug!(topic = %topic, "Unsubscription acknowledged");
            }
            InboundFrame::Error { code, msg, topic } => {
                self.handle_error_event(code, msg, topic, live);
            }
            InboundFrame::OpReply(reply) => {
                let id = reply.id.clone();
                if !self.correlator.resolve(&id, Ok(reply)) {
                    debug!(id = %id, "Unmatched op reply dropped");
                }
            }
            InboundFrame::Data(message) => {
                self.push_raw(text, now);
                self.typed.push(message);
            }
            InboundFrame::Login { code, .. } => {
                debug!(code = %code, "Unsolicited login response");
            }
            InboundFrame::Event { event, .. } => {
                debug!(event = %event, "Stream event");
                self.push_raw(text, now);
            }
            InboundFrame::Unknown(_) => {
                self.push_raw(text, now);
            }
        }
        Ok(())
    }

    fn handle_error_event(
        &self,
        code: String,
        msg: String,
        topic: Option<Topic>,
        live: &mut LiveSubscriptions,
    ) {
        let err = GatewayError::Op {
            op: "event".to_string(),
            code: code.clone(),
            message: msg.clone(),
        };
        self.record_error(&err);

        // arg가 없으면 가장 오래된 미확인 요청에 귀속
        let target = topic.or_else(|| live.oldest_pending().map(|(t, _)| t));
        match target {
            Some(topic) => {
                let was_unsubscribe = live.fail(&topic);
                let counter = if was_unsubscribe {
                    &self.counters.unsubscribe_err
                } else {
                    &self.counters.subscribe_err
                };
                SessionCounters::incr(counter);
                warn!(topic = %topic, code = %code, msg = %msg, "Subscription request rejected");
            }
            None => {
                if !self.correlator.resolve_oldest(Err(err)) {
                    warn!(code = %code, msg = %msg, "Unattributed stream error event");
                }
            }
        }
    }

    fn push_raw(&self, text: String, received_at: DateTime<Utc>) {
        if let Some(raw) = &self.raw {
            raw.push(RawMessage { text, received_at });
        }
    }
}
