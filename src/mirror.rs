//! Mirror actor: operator stream lifecycle, reconnection and the control
//! plane.
//!
//! One task owns [`MirrorState`] and processes everything serially:
//! stream bytes, control requests and timer expiries. Timers are
//! deadlines kept in local state and raced inside the `select!` loop, so
//! resetting a deadline implicitly cancels the old one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event::RawEvent;
use crate::framing::FrameDecoder;
use crate::metrics;
use crate::pubsub::{SubscriberTable, Subscription};
use crate::state::{Action, HostResolver, MirrorState, SystemResolver};
use crate::task::{Task, TaskId};

/// Caller-side timeout for `subscribe()`.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

const CONTROL_CAPACITY: usize = 32;

enum Control {
    Subscribe {
        name: String,
        reply: oneshot::Sender<Result<Subscription, SyncError>>,
    },
    Poll {
        reply: oneshot::Sender<HashMap<TaskId, Task>>,
    },
}

/// Cloneable handle to a running mirror.
#[derive(Clone)]
pub struct MirrorHandle {
    ctrl: mpsc::Sender<Control>,
    leader: Arc<AtomicBool>,
}

impl MirrorHandle {
    /// Register a named subscriber and return its subscription.
    pub async fn subscribe(&self, name: &str) -> Result<Subscription, SyncError> {
        let (reply, response) = oneshot::channel();
        self.ctrl
            .send(Control::Subscribe {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| SyncError::MirrorClosed)?;
        match tokio::time::timeout(SUBSCRIBE_TIMEOUT, response).await {
            Err(_) => Err(SyncError::SubscribeTimeout),
            Ok(Err(_)) => Err(SyncError::MirrorClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// One-shot pull of the publishable tasks, for hosts that do not
    /// consume the subscription stream.
    pub async fn poll(&self) -> Result<HashMap<TaskId, Task>, SyncError> {
        let (reply, response) = oneshot::channel();
        self.ctrl
            .send(Control::Poll { reply })
            .await
            .map_err(|_| SyncError::MirrorClosed)?;
        response.await.map_err(|_| SyncError::MirrorClosed)
    }

    /// Whether a stream to the leading master is currently established.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }
}

/// Exponential backoff with jitter between configured bounds.
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    /// Next delay: uniform between the minimum and the current step; the
    /// step then doubles up to the cap.
    fn next(&mut self) -> Duration {
        let min = self.min.as_millis() as u64;
        let cap = (self.current.as_millis() as u64).max(min);
        self.current = (self.current * 2).min(self.max);
        Duration::from_millis(rand::thread_rng().gen_range(min..=cap))
    }
}

#[derive(Debug, Clone, Copy)]
enum Window {
    Agents,
    Tasks,
}

#[derive(Debug)]
enum StreamEnd {
    Shutdown,
    Watchdog,
    Closed,
    Transport,
    Decode,
}

/// The mirror actor. Create with [`Mirror::new`], then drive with
/// [`Mirror::run`].
pub struct Mirror {
    config: SyncConfig,
    http: reqwest::Client,
    resolver: Arc<dyn HostResolver>,
    state: MirrorState,
    subs: SubscriberTable,
    ctrl_rx: mpsc::Receiver<Control>,
    leader: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Mirror {
    /// Build a mirror using the system resolver.
    pub fn new(config: SyncConfig, cancel: CancellationToken) -> Result<(Self, MirrorHandle), SyncError> {
        Self::with_resolver(config, cancel, Arc::new(SystemResolver))
    }

    /// Build a mirror with a custom hostname resolver.
    pub fn with_resolver(
        config: SyncConfig,
        cancel: CancellationToken,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<(Self, MirrorHandle), SyncError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_CAPACITY);
        let leader = Arc::new(AtomicBool::new(false));
        let handle = MirrorHandle {
            ctrl: ctrl_tx,
            leader: leader.clone(),
        };
        let mirror = Self {
            config,
            http,
            resolver,
            state: MirrorState::new(),
            subs: SubscriberTable::new(),
            ctrl_rx,
            leader,
            cancel,
        };
        Ok((mirror, handle))
    }

    /// Run until cancelled: connect, stream, reset, back off, repeat.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.config.reconnect_timeout(),
            self.config.reconnect_max_timeout(),
        );
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.connect().await {
                Ok(stream) => {
                    info!(master = %self.config.master_url, "subscribed to the operator stream");
                    backoff.reset();
                    self.leader.store(true, Ordering::Relaxed);
                    metrics::set_is_leader(true);

                    let end = self.stream_loop(stream).await;

                    self.leader.store(false, Ordering::Relaxed);
                    metrics::set_is_leader(false);
                    warn!(reason = ?end, "operator stream ended");
                    let actions = self.state.reset();
                    let mut no_watchdog = None;
                    let mut no_readiness = None;
                    self.apply_actions(actions, &mut no_watchdog, &mut no_readiness)
                        .await;
                    if matches!(end, StreamEnd::Shutdown) {
                        return;
                    }
                }
                // Not the leader: somebody else owns the stream, try
                // again quietly.
                Err(SyncError::NotLeader) => {
                    debug!(master = %self.config.master_url, "redirected; not the leading master");
                }
                Err(err) => {
                    warn!(master = %self.config.master_url, %err, "SUBSCRIBE failed");
                    metrics::record_failure();
                }
            }
            let delay = backoff.next();
            debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            if !self.idle(delay).await {
                return;
            }
        }
    }

    async fn connect(
        &self,
    ) -> Result<impl futures::Stream<Item = reqwest::Result<bytes::Bytes>>, SyncError> {
        let url = format!("{}/api/v1", self.config.master_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("Accept", "application/recordio")
            .json(&serde_json::json!({"type": "SUBSCRIBE"}))
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::TEMPORARY_REDIRECT {
            return Err(SyncError::NotLeader);
        }
        if !status.is_success() {
            return Err(SyncError::SubscribeStatus(status));
        }
        Ok(response.bytes_stream())
    }

    async fn stream_loop<S>(&mut self, stream: S) -> StreamEnd
    where
        S: futures::Stream<Item = reqwest::Result<bytes::Bytes>>,
    {
        tokio::pin!(stream);
        let mut decoder = FrameDecoder::new();
        let mut watchdog: Option<Instant> = None;
        let mut readiness: Option<(Window, Instant)> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return StreamEnd::Shutdown,

                Some(ctrl) = self.ctrl_rx.recv() => self.handle_control(ctrl),

                _ = tokio::time::sleep_until(watchdog.unwrap_or_else(Instant::now)),
                    if watchdog.is_some() =>
                {
                    warn!("heartbeat watchdog expired");
                    return StreamEnd::Watchdog;
                }

                _ = tokio::time::sleep_until(
                        readiness.map(|(_, at)| at).unwrap_or_else(Instant::now),
                    ),
                    if readiness.is_some() =>
                {
                    let Some((window, _)) = readiness.take() else {
                        continue;
                    };
                    let actions = match window {
                        Window::Agents => self.state.on_agents_window_timeout(),
                        Window::Tasks => self.state.on_tasks_window_timeout(),
                    };
                    self.apply_actions(actions, &mut watchdog, &mut readiness).await;
                }

                chunk = stream.next() => match chunk {
                    None => return StreamEnd::Closed,
                    Some(Err(err)) => {
                        warn!(%err, "operator stream transport failed");
                        return StreamEnd::Transport;
                    }
                    Some(Ok(bytes)) => {
                        metrics::record_bytes(bytes.len());
                        decoder.push(&bytes);
                        loop {
                            match decoder.next() {
                                Ok(None) => break,
                                Ok(Some(value)) => {
                                    metrics::record_message();
                                    let event = match RawEvent::from_value(value) {
                                        Ok(event) => event,
                                        Err(err) => {
                                            warn!(%err, "undecodable operator event");
                                            return StreamEnd::Decode;
                                        }
                                    };
                                    let actions = self
                                        .state
                                        .apply_event(&event, self.resolver.as_ref())
                                        .await;
                                    self.apply_actions(actions, &mut watchdog, &mut readiness)
                                        .await;
                                    metrics::record_state_counts(
                                        self.state.agents_len(),
                                        self.state.frameworks_len(),
                                        self.state.tasks_len(),
                                        self.state.waiting_tasks_len(),
                                    );
                                }
                                Err(err) => {
                                    warn!(%err, "framing error on the operator stream");
                                    return StreamEnd::Decode;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn apply_actions(
        &mut self,
        actions: Vec<Action>,
        watchdog: &mut Option<Instant>,
        readiness: &mut Option<(Window, Instant)>,
    ) {
        for action in actions {
            match action {
                Action::Publish(event) => {
                    // A third of the heartbeat bounds each subscriber, so
                    // even a full fan-out cannot eat the watchdog window.
                    let ack_timeout = self.state.heartbeat() / 3;
                    self.subs.publish(&event, ack_timeout).await;
                }
                Action::ArmWatchdog => {
                    *watchdog = Some(Instant::now() + 3 * self.state.heartbeat());
                }
                Action::ArmAgentsWindow => {
                    *readiness = Some((
                        Window::Agents,
                        Instant::now() + self.config.agents_readiness_timeout(),
                    ));
                }
                Action::ArmTasksWindow => {
                    *readiness = Some((
                        Window::Tasks,
                        Instant::now() + self.config.tasks_readiness_timeout(),
                    ));
                }
            }
        }
    }

    fn handle_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Subscribe { name, reply } => {
                let _ = reply.send(self.subs.subscribe(&name));
            }
            Control::Poll { reply } => {
                let _ = reply.send(self.state.publishable_tasks());
            }
        }
    }

    /// Sleep through the backoff delay while still serving control
    /// requests. False means shutdown was requested.
    async fn idle(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                Some(ctrl) = self.ctrl_rx.recv() => self.handle_control(ctrl),
            }
        }
    }
}
