//! The connection driver: one WebSocket, three tasks.
//!
//! [`Connection::open`] dials the endpoint, performs the
//! `connection_init`/`connection_ack` handshake, then spawns the read
//! loop, the write serializer and the keep-alive watchdog. The tasks
//! report the connection's end through a single channel the session
//! control loop owns; the read loop itself never decides whether to
//! reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{self, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{websocket_url, SessionConfig, StatusCodeRange};
use crate::error::Error;
use crate::protocol::{error_message, Event, ProtocolAdapter};
use crate::registry::SubscriptionStatus;
use crate::session::{Hooks, SessionContext};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on the outbound frame queue. Start/stop traffic is small; the
/// bound exists so a wedged socket exerts backpressure instead of growing
/// an unbounded buffer.
const WRITE_QUEUE: usize = 64;

/// Normal closure, sent when the client says goodbye.
const CLOSE_NORMAL: u16 = 1000;

/// How a connection ended, as reported to the session control loop.
#[derive(Debug)]
pub(crate) enum ConnectionEnd {
    /// The peer closed normally (1000/1001); the session ends cleanly.
    Graceful,
    /// Worth reconnecting: transient network failure, keep-alive loss, or
    /// a close status in the configured retry set.
    Retryable(Error),
    /// Not worth reconnecting: an unrecognized close status.
    Fatal(Error),
    /// A data handler returned an error; tears the whole session down.
    Handler(Error),
}

/// Outbound traffic, serialized through one queue so `start`/`stop`
/// ordering relative to `connection_init` is guaranteed by construction.
#[derive(Debug)]
pub(crate) enum WriterCommand {
    Frame(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// A live connection: the writer intake plus the running tasks.
pub(crate) struct Connection {
    writer_tx: mpsc::Sender<WriterCommand>,
    end_rx: mpsc::Receiver<ConnectionEnd>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Dial, initialize and acknowledge, then start the connection tasks.
    ///
    /// Errors out of here are classified by the session: dial failures and
    /// ack timeouts are retryable, an upgrade rejection is fatal.
    pub(crate) async fn open(
        cfg: &SessionConfig,
        adapter: Arc<dyn ProtocolAdapter>,
        ctx: Arc<SessionContext>,
        hooks: Hooks,
    ) -> Result<Self, Error> {
        let request = build_request(cfg, adapter.as_ref())?;
        debug!(url = %request.uri(), subprotocol = adapter.subprotocol(), "dialing");

        let (mut stream, _response) =
            match tokio::time::timeout(cfg.timeout, connect_async(request)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(Error::Connect(e)),
                Err(_) => {
                    return Err(Error::Connect(tungstenite::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "websocket dial timed out",
                    ))))
                }
            };

        let init = adapter.encode_init(cfg.params.resolve().as_ref())?;
        stream
            .send(Message::Text(init))
            .await
            .map_err(Error::Transport)?;
        await_ack(&mut stream, adapter.as_ref(), cfg.timeout).await?;
        debug!("connection acknowledged");

        let (sink, source) = stream.split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE);
        let (end_tx, end_rx) = mpsc::channel(4);
        let (alive_tx, alive_rx) = watch::channel(Instant::now());
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(write_loop(sink, writer_rx, end_tx.clone())),
            tokio::spawn(
                ReadLoop {
                    source,
                    adapter,
                    ctx,
                    hooks,
                    writer_tx: writer_tx.clone(),
                    alive_tx,
                    retry_codes: cfg.retry_status_codes.clone(),
                    end_tx: end_tx.clone(),
                    cancel: cancel.clone(),
                }
                .run(),
            ),
            tokio::spawn(keepalive_watchdog(
                alive_rx,
                cfg.liveness_window(),
                end_tx,
                cancel.clone(),
            )),
        ];

        Ok(Self {
            writer_tx,
            end_rx,
            cancel,
            tasks,
        })
    }

    /// Intake for outbound frames; cloned into the session context so
    /// `subscribe`/`unsubscribe` can emit while the connection lives.
    pub(crate) fn writer(&self) -> mpsc::Sender<WriterCommand> {
        self.writer_tx.clone()
    }

    /// The first terminal event from any of the connection tasks.
    pub(crate) async fn ended(&mut self) -> ConnectionEnd {
        match self.end_rx.recv().await {
            Some(end) => end,
            // All task-side senders gone without a report; treat as a
            // transport reset.
            None => ConnectionEnd::Retryable(Error::Transport(
                tungstenite::Error::ConnectionClosed,
            )),
        }
    }

    /// Tear the connection down: queue the protocol farewell and a normal
    /// close, then stop the tasks, force-aborting any that outlive the
    /// close timeout.
    pub(crate) async fn shutdown(self, terminate: Option<String>, close_timeout: Duration) {
        let Connection {
            writer_tx,
            end_rx,
            cancel,
            mut tasks,
        } = self;
        drop(end_rx);

        if let Some(frame) = terminate {
            let _ = writer_tx.try_send(WriterCommand::Frame(frame));
        }
        let _ = writer_tx.try_send(WriterCommand::Close {
            code: CLOSE_NORMAL,
            reason: String::new(),
        });
        drop(writer_tx);
        cancel.cancel();

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let join_all = async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(close_timeout, join_all).await.is_err() {
            warn!("connection tasks outlived the close timeout; aborting");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

fn build_request(
    cfg: &SessionConfig,
    adapter: &dyn ProtocolAdapter,
) -> Result<tungstenite::handshake::client::Request, Error> {
    let mut request = websocket_url(&cfg.url)
        .into_client_request()
        .map_err(Error::Connect)?;
    let headers = request.headers_mut();
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(adapter.subprotocol()),
    );
    for (name, value) in &cfg.ws_options.headers {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::Config(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Config(format!("invalid value for header {name}")))?;
        headers.insert(name, value);
    }
    Ok(request)
}

/// Drive the socket until the server acknowledges `connection_init`.
///
/// Keep-alives and unknown frames before the ack are tolerated; a
/// `connection_error` or a close ends the attempt.
async fn await_ack(
    stream: &mut WsStream,
    adapter: &dyn ProtocolAdapter,
    ack_timeout: Duration,
) -> Result<(), Error> {
    let deadline = Instant::now() + ack_timeout;
    loop {
        let msg = match timeout_at(deadline, stream.next()).await {
            Ok(msg) => msg,
            Err(_) => return Err(Error::AckTimeout),
        };
        match msg {
            None => return Err(Error::Transport(tungstenite::Error::ConnectionClosed)),
            Some(Err(e)) => return Err(Error::Transport(e)),
            Some(Ok(Message::Text(text))) => match adapter.decode(&text)? {
                Event::Ack => return Ok(()),
                Event::ConnectionError { payload } => {
                    return Err(Error::Server(error_message(&payload)))
                }
                Event::KeepAlive { .. } => {}
                other => debug!(event = ?other, "frame before ack ignored"),
            },
            Some(Ok(Message::Close(frame))) => return Err(close_error(frame)),
            Some(Ok(Message::Ping(data))) => {
                let _ = stream.send(Message::Pong(data)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}

fn close_error(frame: Option<CloseFrame<'_>>) -> Error {
    match frame {
        Some(frame) => Error::CloseStatus {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => Error::Transport(tungstenite::Error::ConnectionClosed),
    }
}

/// Map a close status onto a disposition per the session's retry set.
fn classify_close(frame: Option<CloseFrame<'_>>, retry_codes: &[StatusCodeRange]) -> ConnectionEnd {
    let Some(frame) = frame else {
        return ConnectionEnd::Retryable(Error::Transport(tungstenite::Error::ConnectionClosed));
    };
    let code = u16::from(frame.code);
    let err = Error::CloseStatus {
        code,
        reason: frame.reason.into_owned(),
    };
    if matches!(frame.code, CloseCode::Normal | CloseCode::Away) {
        ConnectionEnd::Graceful
    } else if retry_codes.iter().any(|r| r.contains(i32::from(code))) {
        ConnectionEnd::Retryable(err)
    } else {
        ConnectionEnd::Fatal(err)
    }
}

/// The read loop: decodes frames and dispatches events without blocking
/// on anything but the handler itself.
///
/// Handlers run inline, so a slow handler serializes delivery across the
/// connection's subscriptions; the keep-alive watchdog bounds the damage.
struct ReadLoop {
    source: SplitStream<WsStream>,
    adapter: Arc<dyn ProtocolAdapter>,
    ctx: Arc<SessionContext>,
    hooks: Hooks,
    writer_tx: mpsc::Sender<WriterCommand>,
    alive_tx: watch::Sender<Instant>,
    retry_codes: Vec<StatusCodeRange>,
    end_tx: mpsc::Sender<ConnectionEnd>,
    cancel: CancellationToken,
}

impl ReadLoop {
    async fn run(mut self) {
        let end = loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break ConnectionEnd::Graceful,
                msg = self.source.next() => msg,
            };
            match msg {
                None => {
                    break ConnectionEnd::Retryable(Error::Transport(
                        tungstenite::Error::ConnectionClosed,
                    ))
                }
                Some(Err(e)) => break ConnectionEnd::Retryable(Error::Transport(e)),
                Some(Ok(Message::Close(frame))) => {
                    break classify_close(frame, &self.retry_codes)
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.writer_tx.try_send(WriterCommand::Pong(data));
                }
                Some(Ok(Message::Text(text))) => match self.adapter.decode(&text) {
                    Ok(event) => {
                        if let Some(end) = self.dispatch(event) {
                            break end;
                        }
                    }
                    Err(e) => break ConnectionEnd::Retryable(e),
                },
                Some(Ok(other)) => debug!(?other, "non-text frame ignored"),
            }
        };
        let _ = self.end_tx.try_send(end);
    }

    /// Route one decoded event. Returns the connection's end when the
    /// event is terminal for the whole session.
    fn dispatch(&self, event: Event) -> Option<ConnectionEnd> {
        match event {
            // A second ack is meaningless but harmless.
            Event::Ack => None,
            Event::KeepAlive { payload } => {
                let _ = self.alive_tx.send(Instant::now());
                if let Some(hook) = &self.hooks.connection_alive {
                    hook();
                }
                match self.adapter.encode_keepalive_response(payload.as_deref()) {
                    Ok(Some(reply)) => {
                        let _ = self.writer_tx.try_send(WriterCommand::Frame(reply));
                    }
                    Ok(None) => {}
                    Err(e) => return Some(ConnectionEnd::Retryable(e)),
                }
                None
            }
            Event::Data { id, payload } => {
                let Some(sub) = self.ctx.registry.get_by_id(&id) else {
                    debug!(%id, "data for unknown subscription");
                    return None;
                };
                if sub.status() == SubscriptionStatus::Unsubscribed {
                    return None;
                }
                if let Err(e) = (sub.handler())(Ok(&payload)) {
                    return Some(ConnectionEnd::Handler(Error::Handler(e)));
                }
                None
            }
            Event::OperationError { id, payload } => {
                let Some(sub) = self.ctx.registry.get_by_id(&id) else {
                    debug!(%id, "error for unknown subscription");
                    return None;
                };
                if sub.status() == SubscriptionStatus::Unsubscribed {
                    return None;
                }
                let err = Error::Operation(error_message(&payload));
                if let Err(e) = (sub.handler())(Err(err)) {
                    return Some(ConnectionEnd::Handler(Error::Handler(e)));
                }
                None
            }
            Event::Complete { id } => {
                let Some(sub) = self.ctx.registry.get_by_id(&id) else {
                    debug!(%id, "complete for unknown subscription");
                    return None;
                };
                let key = sub.key().to_string();
                let _ = self.ctx.registry.set_status(&key, SubscriptionStatus::Completed);
                if let Some(hook) = &self.hooks.subscription_complete {
                    if let Some(completed) = self.ctx.registry.get_by_key(&key) {
                        hook(completed);
                    }
                }
                self.ctx.registry.remove(&key);
                self.ctx.maybe_exit_when_empty();
                None
            }
            Event::ConnectionError { payload } => Some(ConnectionEnd::Retryable(Error::Server(
                error_message(&payload),
            ))),
            Event::Unknown => {
                warn!("unrecognized frame ignored");
                None
            }
        }
    }
}

/// The write serializer: the socket's only writer.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<WriterCommand>,
    end_tx: mpsc::Sender<ConnectionEnd>,
) {
    while let Some(cmd) = rx.recv().await {
        let result = match cmd {
            WriterCommand::Frame(text) => sink.send(Message::Text(text)).await,
            WriterCommand::Pong(data) => sink.send(Message::Pong(data)).await,
            WriterCommand::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = sink.flush().await;
                return;
            }
        };
        if let Err(e) = result {
            let _ = end_tx.try_send(ConnectionEnd::Retryable(Error::Transport(e)));
            return;
        }
    }
}

/// Drain the connection when server keep-alives stop.
///
/// Arms only after the first keep-alive is seen, so servers that never
/// send them are not penalized; from then on, silence past the liveness
/// window marks the connection dead with a retryable disposition.
async fn keepalive_watchdog(
    mut alive_rx: watch::Receiver<Instant>,
    window: Duration,
    end_tx: mpsc::Sender<ConnectionEnd>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        changed = alive_rx.changed() => {
            if changed.is_err() {
                return;
            }
        }
    }
    loop {
        let deadline = *alive_rx.borrow_and_update() + window;
        if Instant::now() >= deadline {
            debug!(?window, "keep-alive window elapsed");
            let _ = end_tx.try_send(ConnectionEnd::Retryable(Error::KeepAliveTimeout(window)));
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
            changed = alive_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
