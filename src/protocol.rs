//! The two GraphQL-over-WebSocket sub-protocols.
//!
//! Both protocols exchange JSON text frames of the shape
//! `{"type": "...", "id"?: "...", "payload"?: ...}` but disagree on message
//! names, keep-alive direction and the shape of operation errors. Each
//! variant lives behind [`ProtocolAdapter`] so nothing outside this module
//! knows wire-level naming.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Error;

/// Sub-protocol header value for `subscriptions-transport-ws`.
///
/// The legacy protocol registered the name `graphql-ws` before the newer
/// protocol existed; the naming inversion is historical and load-bearing.
const SUBPROTOCOL_TRANSPORT_WS: &str = "graphql-ws";
/// Sub-protocol header value for `graphql-ws`.
const SUBPROTOCOL_GRAPHQL_WS: &str = "graphql-transport-ws";

/// Which subscription sub-protocol a session speaks.
///
/// Selected at session construction and fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// The legacy `subscriptions-transport-ws` protocol. Server keep-alives
    /// are `ka` frames; operation errors carry a single object payload.
    #[default]
    SubscriptionsTransportWs,
    /// The current `graphql-ws` protocol. Liveness uses `ping`/`pong`;
    /// operation errors carry an array payload; abnormal termination uses
    /// WebSocket close codes 4400+.
    GraphqlWs,
}

impl Protocol {
    pub(crate) fn adapter(self) -> Arc<dyn ProtocolAdapter> {
        match self {
            Protocol::SubscriptionsTransportWs => Arc::new(TransportWsAdapter),
            Protocol::GraphqlWs => Arc::new(GraphqlWsAdapter),
        }
    }
}

/// A GraphQL operation as sent in `start`/`subscribe` payloads.
///
/// Building this from a typed request template is the query builder's job;
/// the session only stores and transmits it.
#[derive(Debug, Clone, Serialize)]
pub struct OperationPayload {
    /// The operation document, e.g. `subscription{helloSaid{id,msg}}`.
    pub query: String,
    /// Variables map, omitted from the wire when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
    /// Operation name, omitted from the wire when absent.
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl OperationPayload {
    /// A payload with just a query document.
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }

    /// Set the variables map.
    pub fn variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// A decoded inbound frame, normalized across protocols.
#[derive(Debug)]
pub enum Event {
    /// The server accepted `connection_init`.
    Ack,
    /// A server liveness signal (`ka` or `ping`), with the raw ping
    /// payload when the protocol carries one.
    KeepAlive { payload: Option<Vec<u8>> },
    /// An execution result for one subscription. `payload` holds the raw
    /// bytes of the result's `data` field, byte-identical to the wire.
    Data { id: String, payload: Vec<u8> },
    /// The server completed one subscription.
    Complete { id: String },
    /// An operation-level error for one subscription. `payload` holds the
    /// raw error payload (object in subscriptions-transport-ws, array in
    /// graphql-ws).
    OperationError { id: String, payload: Vec<u8> },
    /// A connection-level error; the whole connection is suspect.
    ConnectionError { payload: Vec<u8> },
    /// A frame this protocol does not recognize. Logged and ignored.
    Unknown,
}

/// Encodes and decodes one wire protocol.
///
/// The session holds exactly one adapter; all protocol-specific lifecycle
/// rules live behind this interface.
pub(crate) trait ProtocolAdapter: Send + Sync {
    /// Value for the `Sec-WebSocket-Protocol` request header.
    fn subprotocol(&self) -> &'static str;

    /// The `connection_init` frame carrying the caller's parameters.
    fn encode_init(&self, params: Option<&serde_json::Value>) -> Result<String, Error>;

    /// The frame that starts an operation under the given wire id.
    fn encode_start(&self, id: &str, payload: &OperationPayload) -> Result<String, Error>;

    /// The frame that stops an operation.
    fn encode_stop(&self, id: &str) -> Result<String, Error>;

    /// The farewell frame sent before closing, if the protocol has one.
    /// `None` means the protocol terminates with a plain WebSocket close.
    fn encode_terminate(&self) -> Result<Option<String>, Error>;

    /// The reply owed for an inbound keep-alive, if any, echoing the
    /// keep-alive's payload back to the server.
    fn encode_keepalive_response(&self, payload: Option<&[u8]>) -> Result<Option<String>, Error>;

    /// Decode one text frame. Unrecognized `type` values map to
    /// [`Event::Unknown`]; malformed JSON is a protocol error.
    fn decode(&self, text: &str) -> Result<Event, Error>;
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    payload: Option<Box<RawValue>>,
}

/// The `data`/`next` payload shape: a GraphQL execution result.
#[derive(Deserialize)]
struct ExecutionResult {
    data: Option<Box<RawValue>>,
    errors: Option<Box<RawValue>>,
}

fn encode_frame(
    kind: &'static str,
    id: Option<&str>,
    payload: Option<serde_json::Value>,
) -> Result<String, Error> {
    serde_json::to_string(&OutboundFrame { kind, id, payload })
        .map_err(|e| Error::Protocol(format!("encoding {kind} frame: {e}")))
}

fn decode_frame(text: &str) -> Result<InboundFrame, Error> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}

fn start_payload(payload: &OperationPayload) -> Result<serde_json::Value, Error> {
    serde_json::to_value(payload).map_err(|e| Error::Protocol(format!("encoding payload: {e}")))
}

fn require_id(frame: &InboundFrame) -> Result<String, Error> {
    frame
        .id
        .clone()
        .ok_or_else(|| Error::Protocol(format!("{} frame without id", frame.kind)))
}

fn payload_bytes(frame: &InboundFrame) -> Vec<u8> {
    frame
        .payload
        .as_ref()
        .map(|p| p.get().as_bytes().to_vec())
        .unwrap_or_default()
}

/// Split an execution result into data or errors, errors winning.
fn result_event(frame: InboundFrame) -> Result<Event, Error> {
    let id = require_id(&frame)?;
    let raw = frame.payload.as_deref().map(RawValue::get).unwrap_or("{}");
    let result: ExecutionResult = serde_json::from_str(raw)
        .map_err(|e| Error::Protocol(format!("malformed execution result: {e}")))?;
    if let Some(errors) = result.errors {
        if errors.get() != "[]" {
            return Ok(Event::OperationError {
                id,
                payload: errors.get().as_bytes().to_vec(),
            });
        }
    }
    let payload = result
        .data
        .map(|d| d.get().as_bytes().to_vec())
        .unwrap_or_default();
    Ok(Event::Data { id, payload })
}

/// Extract a human-readable message from an error payload.
///
/// Accepts `{"message": ...}`, `[{"message": ...}, ...]` and falls back to
/// the raw payload text.
pub(crate) fn error_message(payload: &[u8]) -> String {
    #[derive(Deserialize)]
    struct WithMessage {
        message: String,
    }

    if let Ok(one) = serde_json::from_slice::<WithMessage>(payload) {
        return one.message;
    }
    if let Ok(many) = serde_json::from_slice::<Vec<WithMessage>>(payload) {
        if !many.is_empty() {
            return many
                .into_iter()
                .map(|m| m.message)
                .collect::<Vec<_>>()
                .join("; ");
        }
    }
    String::from_utf8_lossy(payload).into_owned()
}

// ============================================================================
// subscriptions-transport-ws
// ============================================================================

/// The legacy protocol. Keep-alives are unidirectional `ka` frames and the
/// client says goodbye with `connection_terminate`.
struct TransportWsAdapter;

impl ProtocolAdapter for TransportWsAdapter {
    fn subprotocol(&self) -> &'static str {
        SUBPROTOCOL_TRANSPORT_WS
    }

    fn encode_init(&self, params: Option<&serde_json::Value>) -> Result<String, Error> {
        encode_frame("connection_init", None, params.cloned())
    }

    fn encode_start(&self, id: &str, payload: &OperationPayload) -> Result<String, Error> {
        encode_frame("start", Some(id), Some(start_payload(payload)?))
    }

    fn encode_stop(&self, id: &str) -> Result<String, Error> {
        encode_frame("stop", Some(id), None)
    }

    fn encode_terminate(&self) -> Result<Option<String>, Error> {
        encode_frame("connection_terminate", None, None).map(Some)
    }

    fn encode_keepalive_response(&self, _payload: Option<&[u8]>) -> Result<Option<String>, Error> {
        Ok(None)
    }

    fn decode(&self, text: &str) -> Result<Event, Error> {
        let frame = decode_frame(text)?;
        match frame.kind.as_str() {
            "connection_ack" => Ok(Event::Ack),
            "ka" => Ok(Event::KeepAlive { payload: None }),
            "data" => result_event(frame),
            "complete" => Ok(Event::Complete {
                id: require_id(&frame)?,
            }),
            "error" => Ok(Event::OperationError {
                id: require_id(&frame)?,
                payload: payload_bytes(&frame),
            }),
            "connection_error" => Ok(Event::ConnectionError {
                payload: payload_bytes(&frame),
            }),
            _ => Ok(Event::Unknown),
        }
    }
}

// ============================================================================
// graphql-ws
// ============================================================================

/// The current protocol. Liveness is bidirectional `ping`/`pong` and
/// operations use `subscribe`/`next`; stopping an operation reuses the
/// `complete` name in the client-to-server direction.
struct GraphqlWsAdapter;

impl ProtocolAdapter for GraphqlWsAdapter {
    fn subprotocol(&self) -> &'static str {
        SUBPROTOCOL_GRAPHQL_WS
    }

    fn encode_init(&self, params: Option<&serde_json::Value>) -> Result<String, Error> {
        encode_frame("connection_init", None, params.cloned())
    }

    fn encode_start(&self, id: &str, payload: &OperationPayload) -> Result<String, Error> {
        encode_frame("subscribe", Some(id), Some(start_payload(payload)?))
    }

    fn encode_stop(&self, id: &str) -> Result<String, Error> {
        encode_frame("complete", Some(id), None)
    }

    fn encode_terminate(&self) -> Result<Option<String>, Error> {
        // Termination is a plain WebSocket close with status 1000.
        Ok(None)
    }

    fn encode_keepalive_response(&self, payload: Option<&[u8]>) -> Result<Option<String>, Error> {
        let payload = match payload {
            Some(bytes) => Some(
                serde_json::from_slice(bytes)
                    .map_err(|e| Error::Protocol(format!("malformed ping payload: {e}")))?,
            ),
            None => None,
        };
        encode_frame("pong", None, payload).map(Some)
    }

    fn decode(&self, text: &str) -> Result<Event, Error> {
        let frame = decode_frame(text)?;
        match frame.kind.as_str() {
            "connection_ack" => Ok(Event::Ack),
            "ping" | "pong" => Ok(Event::KeepAlive {
                payload: frame.payload.map(|p| p.get().as_bytes().to_vec()),
            }),
            "next" => result_event(frame),
            "complete" => Ok(Event::Complete {
                id: require_id(&frame)?,
            }),
            "error" => Ok(Event::OperationError {
                id: require_id(&frame)?,
                payload: payload_bytes(&frame),
            }),
            _ => Ok(Event::Unknown),
        }
    }
}
