//! The session manager: public surface and reconnect control loop.
//!
//! A [`SubscriptionClient`] owns the registry and, successively, any
//! number of [`Connection`]s. Subscriptions keep their application-visible
//! key across all of them; only the wire id is reborn with each socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{
    parse_status_code_ranges, ConnectionParams, RetryPolicy, SessionConfig, WebSocketOptions,
};
use crate::connection::{Connection, ConnectionEnd, WriterCommand};
use crate::error::{BoxError, Error};
use crate::protocol::{OperationPayload, Protocol, ProtocolAdapter};
use crate::registry::{
    random_key, Subscription, SubscriptionHandler, SubscriptionRegistry, SubscriptionStatus,
};

/// Consecutive protocol-level refusals (`connection_error` without a
/// subsequent ack) tolerated before the session escalates to fatal.
const MAX_INIT_REFUSALS: u32 = 3;

/// How often `close()` re-checks whether the run loop has drained.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// User-supplied callbacks. Invoked synchronously from the read loop or
/// the control task, never while a registry lock is held; each must
/// complete quickly or schedule its own work.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub connected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub disconnected: Option<Arc<dyn Fn() + Send + Sync>>,
    pub connection_alive: Option<Arc<dyn Fn() + Send + Sync>>,
    pub subscription_complete: Option<Arc<dyn Fn(Subscription) + Send + Sync>>,
    pub error: Option<Arc<dyn Fn(&SessionHandle, Error) -> Option<Error> + Send + Sync>>,
}

/// State shared between the control task, the read loop and any
/// [`SessionHandle`]s: the registry plus the session's lifecycle flags.
pub(crate) struct SessionContext {
    pub registry: SubscriptionRegistry,
    /// Writer intake of the live connection, if any.
    writer: Mutex<Option<mpsc::Sender<WriterCommand>>>,
    /// Cancelled to stop the current run gracefully.
    stop: Mutex<CancellationToken>,
    pub running: AtomicBool,
    closing: AtomicBool,
    exit_when_no_subscription: AtomicBool,
}

impl SessionContext {
    fn new(exit_when_no_subscription: bool) -> Self {
        Self {
            registry: SubscriptionRegistry::default(),
            writer: Mutex::new(None),
            stop: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            exit_when_no_subscription: AtomicBool::new(exit_when_no_subscription),
        }
    }

    pub(crate) fn writer(&self) -> Option<mpsc::Sender<WriterCommand>> {
        lock(&self.writer).clone()
    }

    fn set_writer(&self, tx: mpsc::Sender<WriterCommand>) {
        *lock(&self.writer) = Some(tx);
    }

    fn clear_writer(&self) {
        *lock(&self.writer) = None;
    }

    /// Install and return a fresh stop token for a new run.
    fn new_stop_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.stop) = token.clone();
        token
    }

    fn request_stop(&self) {
        lock(&self.stop).cancel();
    }

    /// Stop the session when the registry has emptied and the session is
    /// configured to exit then. Called after every removal.
    pub(crate) fn maybe_exit_when_empty(&self) {
        if self.exit_when_no_subscription.load(Ordering::Acquire)
            && self.registry.count(None) == 0
        {
            debug!("no subscriptions left; stopping session");
            self.request_stop();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn subscribe_on(
    ctx: &SessionContext,
    adapter: &Arc<dyn ProtocolAdapter>,
    payload: OperationPayload,
    handler: SubscriptionHandler,
) -> Result<String, Error> {
    if payload.query.trim().is_empty() {
        return Err(Error::MalformedQuery);
    }
    let key = random_key();
    ctx.registry
        .insert(Subscription::new(key.clone(), payload.clone(), handler))?;
    // If a connection is live, start immediately; otherwise the next
    // replay picks the subscription up.
    if let Some(writer) = ctx.writer() {
        let frame = adapter.encode_start(&key, &payload)?;
        if writer.try_send(WriterCommand::Frame(frame)).is_ok() {
            let _ = ctx.registry.set_status(&key, SubscriptionStatus::Running);
        } else {
            warn!(key = %key, "write queue full; subscription stays waiting");
        }
    }
    Ok(key)
}

fn unsubscribe_on(
    ctx: &SessionContext,
    adapter: &Arc<dyn ProtocolAdapter>,
    key: &str,
) -> Result<(), Error> {
    let sub = ctx
        .registry
        .get_by_key(key)
        .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
    let _ = ctx
        .registry
        .set_status(key, SubscriptionStatus::Unsubscribed);
    // Only subscriptions the server knows about need a stop frame;
    // anything still waiting disappears without wire traffic.
    if sub.status() == SubscriptionStatus::Running {
        if let Some(writer) = ctx.writer() {
            let frame = adapter.encode_stop(sub.id())?;
            let _ = writer.try_send(WriterCommand::Frame(frame));
        }
    }
    ctx.registry.remove(key);
    ctx.maybe_exit_when_empty();
    Ok(())
}

/// A cheap, clonable view of a running session.
///
/// Hooks receive one of these so they can reenter the session:
/// `subscribe`, `unsubscribe` and `close` are all safe to call from
/// inside any hook.
#[derive(Clone)]
pub struct SessionHandle {
    ctx: Arc<SessionContext>,
    adapter: Arc<dyn ProtocolAdapter>,
}

impl SessionHandle {
    /// Register a subscription; see [`SubscriptionClient::subscribe`].
    pub fn subscribe<F>(&self, payload: OperationPayload, handler: F) -> Result<String, Error>
    where
        F: Fn(Result<&[u8], Error>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        subscribe_on(&self.ctx, &self.adapter, payload, Arc::new(handler))
    }

    /// Stop a subscription; see [`SubscriptionClient::unsubscribe`].
    pub fn unsubscribe(&self, key: &str) -> Result<(), Error> {
        unsubscribe_on(&self.ctx, &self.adapter, key)
    }

    /// Request the session to stop. Non-blocking and non-recursive, so it
    /// is safe from inside hooks; the pending `run` tears down and
    /// returns.
    pub fn close(&self) {
        self.ctx.request_stop();
    }

    /// Look up a subscription by its stable key.
    pub fn get_subscription(&self, key: &str) -> Option<Subscription> {
        self.ctx.registry.get_by_key(key)
    }

    /// Number of registered subscriptions, optionally filtered by status.
    pub fn subscriptions_len(&self, filter: Option<&[SubscriptionStatus]>) -> usize {
        self.ctx.registry.count(filter)
    }
}

/// A GraphQL subscription client multiplexing many subscriptions over one
/// WebSocket, with transparent reconnection.
///
/// Configure with the `with_*` methods and hook setters, register
/// subscriptions, then call [`run`](Self::run); `run` blocks until the
/// session terminates. Reconnects replay every live subscription under a
/// fresh wire id, so servers may redeliver data the handler has already
/// seen; deduplication is the application's concern.
pub struct SubscriptionClient {
    cfg: SessionConfig,
    protocol: Protocol,
    adapter: Arc<dyn ProtocolAdapter>,
    hooks: Hooks,
    ctx: Arc<SessionContext>,
}

impl SubscriptionClient {
    /// A client for the given endpoint. `http(s)` URLs are rewritten to
    /// their `ws(s)` equivalents at connect time.
    pub fn new(url: impl Into<String>) -> Self {
        let protocol = Protocol::default();
        Self {
            cfg: SessionConfig::new(url.into()),
            protocol,
            adapter: protocol.adapter(),
            hooks: Hooks::default(),
            ctx: Arc::new(SessionContext::new(true)),
        }
    }

    /// Select the wire protocol. Fixed for the session's lifetime once
    /// `run` is called.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self.adapter = protocol.adapter();
        self
    }

    /// Fixed parameters for `connection_init.payload`.
    pub fn with_connection_params(mut self, params: serde_json::Value) -> Self {
        self.cfg.params = ConnectionParams::Value(params);
        self
    }

    /// A parameter supplier, re-evaluated on every (re)connect.
    pub fn with_connection_params_fn<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.cfg.params = ConnectionParams::Supplier(Arc::new(supplier));
        self
    }

    /// Read/ack deadline. Zero is a configuration error, surfaced by
    /// `run`. Default: 60 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self.cfg.record_error("timeout must be non-zero".to_string());
        } else {
            self.cfg.timeout = timeout;
        }
        self
    }

    /// Total time budget for reconnection before the session gives up.
    /// Zero means retry forever. Default: 5 minutes.
    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.cfg.retry_timeout = retry_timeout;
        self
    }

    /// Shape of the pauses between reconnection attempts.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.cfg.retry_policy = policy;
        self
    }

    /// Close status codes worth reconnecting on, as integers or `"lo-hi"`
    /// ranges. Parsed here; a parse failure is surfaced by `run`.
    pub fn with_retry_status_codes<S: AsRef<str>>(mut self, codes: &[S]) -> Self {
        match parse_status_code_ranges(codes) {
            Ok(ranges) => self.cfg.retry_status_codes = ranges,
            Err(e) => self.cfg.record_error(e.to_string()),
        }
        self
    }

    /// Expected cadence of server keep-alives; the connection is declared
    /// dead after twice this interval without one. Zero disables the
    /// expectation.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.cfg.keep_alive_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Pass-through options for the WebSocket handshake.
    pub fn with_websocket_options(mut self, options: WebSocketOptions) -> Self {
        self.cfg.ws_options = options;
        self
    }

    /// Whether `run` returns once the last subscription is gone.
    /// Default: true.
    pub fn with_exit_when_no_subscription(mut self, exit: bool) -> Self {
        self.cfg.exit_when_no_subscription = exit;
        self.ctx
            .exit_when_no_subscription
            .store(exit, Ordering::Release);
        self
    }

    /// Upper bound on `close()` and on draining a dead connection.
    /// Default: 10 seconds.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.close_timeout = timeout;
        self
    }

    /// Called after each successful ack of a fresh connection.
    pub fn on_connected<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.connected = Some(Arc::new(hook));
        self
    }

    /// Called after any connection terminates, before a reconnect or
    /// before `run` returns.
    pub fn on_disconnected<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.disconnected = Some(Arc::new(hook));
        self
    }

    /// Called once per inbound keep-alive.
    pub fn on_connection_alive<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.hooks.connection_alive = Some(Arc::new(hook));
        self
    }

    /// Called when the server completes a subscription.
    pub fn on_subscription_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(Subscription) + Send + Sync + 'static,
    {
        self.hooks.subscription_complete = Some(Arc::new(hook));
        self
    }

    /// Called with every candidate terminal error. Returning `None`
    /// suppresses it (the session keeps reconnecting); returning
    /// `Some(err)` makes `run` return that error.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SessionHandle, Error) -> Option<Error> + Send + Sync + 'static,
    {
        self.hooks.error = Some(Arc::new(hook));
        self
    }

    /// The wire protocol this session speaks.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// A clonable handle onto this session, for use from hooks or other
    /// tasks.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            ctx: self.ctx.clone(),
            adapter: self.adapter.clone(),
        }
    }

    /// Register a subscription and return its stable key.
    ///
    /// The key identifies the subscription for its whole life, across any
    /// number of reconnects. If the session is running, the start frame
    /// goes out immediately; otherwise it is sent when `run` connects.
    ///
    /// The handler runs inline on the connection's read loop: a slow
    /// handler delays delivery to the other subscriptions on the same
    /// connection.
    pub fn subscribe<F>(&self, payload: OperationPayload, handler: F) -> Result<String, Error>
    where
        F: Fn(Result<&[u8], Error>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        subscribe_on(&self.ctx, &self.adapter, payload, Arc::new(handler))
    }

    /// Stop a subscription and drop it from the registry.
    ///
    /// When the registry empties and the session is configured to exit
    /// when no subscription remains, the running session stops.
    pub fn unsubscribe(&self, key: &str) -> Result<(), Error> {
        unsubscribe_on(&self.ctx, &self.adapter, key)
    }

    /// Look up a subscription by its stable key.
    pub fn get_subscription(&self, key: &str) -> Option<Subscription> {
        self.ctx.registry.get_by_key(key)
    }

    /// Number of registered subscriptions, optionally filtered by status.
    pub fn subscriptions_len(&self, filter: Option<&[SubscriptionStatus]>) -> usize {
        self.ctx.registry.count(filter)
    }

    /// Open the session and block until it terminates.
    ///
    /// Returns `Ok(())` on graceful termination (`close()`, a normal
    /// server close, or the last subscription going away with
    /// exit-when-no-subscription set). Returns the first non-recovered
    /// error otherwise, or the handler-returned error that caused the
    /// teardown.
    ///
    /// After `close()`, `run` may be called again: the registry is
    /// preserved and every retained subscription is replayed.
    pub async fn run(&self) -> Result<(), Error> {
        if let Some(message) = &self.cfg.config_error {
            return Err(Error::Config(message.clone()));
        }
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let result = self.run_loop().await;
        self.ctx.clear_writer();
        self.ctx.running.store(false, Ordering::SeqCst);
        result
    }

    /// Close the session: cancel a pending `run`, send the protocol
    /// farewell where applicable and close the socket.
    ///
    /// Idempotent, and returns within the configured close timeout
    /// regardless of socket state; a connection that will not drain in
    /// time is force-closed by the run loop.
    pub async fn close(&self) -> Result<(), Error> {
        // The closing flag keeps a second concurrent close from issuing a
        // redundant stop request; both calls still wait for the drain.
        if !self.ctx.closing.swap(true, Ordering::SeqCst) {
            self.ctx.request_stop();
        }
        let deadline = Instant::now() + self.cfg.close_timeout;
        while self.ctx.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }
        self.ctx.closing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_loop(&self) -> Result<(), Error> {
        let stop = self.ctx.new_stop_token();
        self.ctx.registry.reset_to_waiting();

        // Consecutive failed attempts since the last acknowledged
        // connection, and when the current outage began.
        let mut attempt: u32 = 0;
        let mut outage_start: Option<Instant> = None;

        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let opened = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                opened = Connection::open(
                    &self.cfg,
                    self.adapter.clone(),
                    self.ctx.clone(),
                    self.hooks.clone(),
                ) => opened,
            };

            let err = match opened {
                Ok(mut conn) => {
                    attempt = 0;
                    outage_start = None;
                    self.ctx.set_writer(conn.writer());
                    if let Some(hook) = &self.hooks.connected {
                        hook();
                    }
                    if let Err(e) = self.replay(&conn).await {
                        self.teardown(conn).await;
                        return Err(e);
                    }

                    let end = tokio::select! {
                        _ = stop.cancelled() => None,
                        end = conn.ended() => Some(end),
                    };
                    self.teardown(conn).await;
                    let Some(end) = end else {
                        return Ok(());
                    };
                    match end {
                        ConnectionEnd::Graceful => return Ok(()),
                        ConnectionEnd::Handler(e) => return Err(e),
                        ConnectionEnd::Fatal(e) => {
                            self.transform_error(e)?;
                            // Suppressed by the error hook: retry.
                            Error::Transport(tungstenite::Error::ConnectionClosed)
                        }
                        ConnectionEnd::Retryable(e) => e,
                    }
                }
                Err(e) => {
                    attempt += 1;
                    debug!(error = %e, attempt, "connection attempt failed");
                    // Anything past the dial counts as a connection that
                    // died; the disconnect hook owes one firing per socket.
                    if !matches!(e, Error::Connect(_) | Error::Config(_)) {
                        if let Some(hook) = &self.hooks.disconnected {
                            hook();
                        }
                    }
                    if self.open_failure_is_fatal(&e, attempt) {
                        self.transform_error(e)?;
                        Error::Transport(tungstenite::Error::ConnectionClosed)
                    } else {
                        e
                    }
                }
            };

            // Retryable path: enforce the retry budget, then back off.
            if attempt == 0 {
                attempt = 1;
            }
            let outage = *outage_start.get_or_insert_with(Instant::now);
            let budget = self.cfg.retry_timeout;
            if !budget.is_zero() && outage.elapsed() >= budget {
                self.transform_error(Error::RetriesExhausted {
                    elapsed: outage.elapsed(),
                    last: Box::new(err),
                })?;
                // Suppressed: restart the budget window.
                outage_start = None;
            }
            let backoff = self.cfg.retry_policy.delay_for(attempt);
            debug!(?backoff, "reconnecting after backoff");
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Whether a failed connection attempt should stop the session.
    fn open_failure_is_fatal(&self, err: &Error, attempt: u32) -> bool {
        match err {
            // The endpoint rejected the upgrade outright.
            Error::Connect(tungstenite::Error::Http(_)) => true,
            Error::Config(_) | Error::MalformedQuery => true,
            Error::CloseStatus { code, .. } => {
                let code = i32::from(*code);
                code != 1000
                    && code != 1001
                    && !self
                        .cfg
                        .retry_status_codes
                        .iter()
                        .any(|range| range.contains(code))
            }
            // Protocol-level refusals are retryable until they repeat
            // without a single successful ack.
            Error::Server(_) => attempt >= MAX_INIT_REFUSALS,
            _ => false,
        }
    }

    /// Apply the error hook to a candidate terminal error. `Err` must
    /// propagate out of `run`; `Ok(())` means the hook suppressed the
    /// error and the session keeps going.
    fn transform_error(&self, err: Error) -> Result<(), Error> {
        match &self.hooks.error {
            Some(hook) => match hook(&self.handle(), err) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Err(err),
        }
    }

    /// Re-start every retained subscription on a fresh connection, each
    /// under a new wire id. Keys never change.
    async fn replay(&self, conn: &Connection) -> Result<(), Error> {
        let writer = conn.writer();
        let pending = self.ctx.registry.snapshot(Some(&[
            SubscriptionStatus::Waiting,
            SubscriptionStatus::Running,
        ]));
        for sub in pending {
            // A subscription that already ran on a dead connection gets a
            // fresh wire id; one that never started keeps its key as id.
            let id = if sub.status() == SubscriptionStatus::Running {
                let id = random_key();
                if self.ctx.registry.update_id(sub.key(), &id).is_err() {
                    // Unsubscribed while we were replaying.
                    continue;
                }
                id
            } else {
                sub.id().to_string()
            };
            let frame = self.adapter.encode_start(&id, sub.payload())?;
            if writer.send(WriterCommand::Frame(frame)).await.is_err() {
                // The connection died mid-replay; its end event follows.
                return Ok(());
            }
            let _ = self
                .ctx
                .registry
                .set_status(sub.key(), SubscriptionStatus::Running);
            debug!(key = sub.key(), id = %id, "subscription started");
        }
        Ok(())
    }

    async fn teardown(&self, conn: Connection) {
        self.ctx.clear_writer();
        let terminate = self.adapter.encode_terminate().unwrap_or_default();
        conn.shutdown(terminate, self.cfg.close_timeout).await;
        if let Some(hook) = &self.hooks.disconnected {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> OperationPayload {
        OperationPayload::query("subscription{helloSaid{id,msg}}")
    }

    #[test]
    fn subscribe_assigns_waiting_subscriptions_with_stable_keys() {
        let client = SubscriptionClient::new("ws://localhost:1");
        let key = client.subscribe(payload(), |_| Ok(())).unwrap();
        assert_eq!(key.len(), 16);

        let sub = client.get_subscription(&key).unwrap();
        assert_eq!(sub.key(), key);
        assert_eq!(sub.id(), key);
        assert_eq!(sub.status(), SubscriptionStatus::Waiting);
        assert_eq!(
            client.subscriptions_len(Some(&[SubscriptionStatus::Waiting])),
            1
        );
    }

    #[test]
    fn subscribe_rejects_empty_queries() {
        let client = SubscriptionClient::new("ws://localhost:1");
        assert!(matches!(
            client.subscribe(OperationPayload::query("  "), |_| Ok(())),
            Err(Error::MalformedQuery)
        ));
    }

    #[test]
    fn unsubscribe_before_run_removes_without_wire_traffic() {
        let client = SubscriptionClient::new("ws://localhost:1");
        let key = client.subscribe(payload(), |_| Ok(())).unwrap();
        client.unsubscribe(&key).unwrap();
        assert_eq!(client.subscriptions_len(None), 0);
        assert!(matches!(
            client.unsubscribe(&key),
            Err(Error::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn invalid_retry_status_codes_surface_from_run() {
        let client = SubscriptionClient::new("ws://localhost:1")
            .with_retry_status_codes(&["a", "2", "3-5"]);
        let err = client.run().await.unwrap_err();
        assert_eq!(err.to_string(), "invalid status code; input: a");
    }

    #[tokio::test]
    async fn zero_timeout_surfaces_from_run() {
        let client = SubscriptionClient::new("ws://localhost:1").with_timeout(Duration::ZERO);
        let err = client.run().await.unwrap_err();
        assert_eq!(err.to_string(), "timeout must be non-zero");
    }

    #[tokio::test]
    async fn close_without_run_returns_immediately() {
        let client = SubscriptionClient::new("ws://localhost:1");
        client.close().await.unwrap();
        client.close().await.unwrap();
    }

    #[test]
    fn handle_shares_the_registry_with_the_client() {
        let client = SubscriptionClient::new("ws://localhost:1");
        let handle = client.handle();
        let key = handle.subscribe(payload(), |_| Ok(())).unwrap();
        assert!(client.get_subscription(&key).is_some());
        handle.unsubscribe(&key).unwrap();
        assert_eq!(client.subscriptions_len(None), 0);
    }
}
