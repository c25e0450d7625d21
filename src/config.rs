//! Session configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Pause schedule between reconnection attempts.
///
/// Pauses start at `first_delay` and are multiplied by `growth` after
/// every failed attempt, saturating at `max_delay`. How long the session
/// keeps trying at all is governed by its retry timeout, not by this.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause before the first reconnection attempt.
    pub first_delay: Duration,
    /// Ceiling on the pause between attempts.
    pub max_delay: Duration,
    /// Factor applied to the pause after each failed attempt.
    pub growth: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            growth: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The pause owed before the given attempt, counted from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.first_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.growth);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

/// Opaque parameters forwarded in `connection_init.payload`.
///
/// The supplier variant is re-evaluated on every (re)connect, so
/// short-lived credentials stay fresh across reconnects.
#[derive(Clone, Default)]
pub enum ConnectionParams {
    /// Send no payload.
    #[default]
    None,
    /// A fixed value.
    Value(serde_json::Value),
    /// A supplier called on each (re)connect.
    Supplier(Arc<dyn Fn() -> serde_json::Value + Send + Sync>),
}

impl ConnectionParams {
    pub(crate) fn resolve(&self) -> Option<serde_json::Value> {
        match self {
            ConnectionParams::None => None,
            ConnectionParams::Value(v) => Some(v.clone()),
            ConnectionParams::Supplier(f) => Some(f()),
        }
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionParams::None => f.write_str("None"),
            ConnectionParams::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ConnectionParams::Supplier(_) => f.write_str("Supplier(..)"),
        }
    }
}

/// Pass-through options for the WebSocket handshake.
#[derive(Debug, Clone, Default)]
pub struct WebSocketOptions {
    /// Extra request headers for the upgrade request. The sub-protocol
    /// header is owned by the session and cannot be overridden here.
    pub headers: Vec<(String, String)>,
}

/// An inclusive close-status range, parsed from `"4400"` or `"4400-4499"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodeRange {
    lo: i32,
    hi: i32,
}

impl StatusCodeRange {
    pub fn contains(&self, code: i32) -> bool {
        self.lo <= code && code <= self.hi
    }
}

/// Parse retry status code entries: single integers or `"lo-hi"` ranges.
pub(crate) fn parse_status_code_ranges<S: AsRef<str>>(
    inputs: &[S],
) -> Result<Vec<StatusCodeRange>, Error> {
    inputs
        .iter()
        .map(|input| {
            let input = input.as_ref();
            let invalid = || Error::InvalidStatusCode {
                input: input.to_string(),
            };
            match input.split_once('-') {
                Some((lo, hi)) => {
                    let lo = lo.trim().parse::<i32>().map_err(|_| invalid())?;
                    let hi = hi.trim().parse::<i32>().map_err(|_| invalid())?;
                    Ok(StatusCodeRange { lo, hi })
                }
                None => {
                    let code = input.trim().parse::<i32>().map_err(|_| invalid())?;
                    Ok(StatusCodeRange { lo: code, hi: code })
                }
            }
        })
        .collect()
}

/// Resolved session configuration. Mutated only by the `with_*`
/// configurators before `run`.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub url: String,
    pub params: ConnectionParams,
    /// Read/ack deadline.
    pub timeout: Duration,
    /// Total backoff budget before reconnection gives up. Zero disables
    /// the budget (retry forever).
    pub retry_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub retry_status_codes: Vec<StatusCodeRange>,
    /// Expected cadence of server keep-alives. The watchdog drains the
    /// connection after twice this interval without one; `None` falls back
    /// to the session timeout as the liveness window.
    pub keep_alive_interval: Option<Duration>,
    pub ws_options: WebSocketOptions,
    pub exit_when_no_subscription: bool,
    /// Upper bound on `close()` and on draining a dead connection.
    pub close_timeout: Duration,
    /// First configuration mistake, surfaced by `run`.
    pub config_error: Option<String>,
}

impl SessionConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            params: ConnectionParams::None,
            timeout: Duration::from_secs(60),
            retry_timeout: Duration::from_secs(300),
            retry_policy: RetryPolicy::default(),
            retry_status_codes: Vec::new(),
            keep_alive_interval: None,
            ws_options: WebSocketOptions::default(),
            exit_when_no_subscription: true,
            close_timeout: Duration::from_secs(10),
            config_error: None,
        }
    }

    /// The liveness window: twice the expected keep-alive cadence.
    pub fn liveness_window(&self) -> Duration {
        match self.keep_alive_interval {
            Some(interval) => interval * 2,
            None => self.timeout,
        }
    }

    pub fn record_error(&mut self, message: String) {
        if self.config_error.is_none() {
            self.config_error = Some(message);
        }
    }
}

/// Map an `http(s)` endpoint to its `ws(s)` equivalent. Endpoints already
/// using a WebSocket scheme pass through untouched.
pub(crate) fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
