#![deny(unsafe_code)]

//! Multiplexed GraphQL subscriptions over one WebSocket.
//!
//! A [`SubscriptionClient`] owns a single WebSocket connection, speaks one
//! of the two subscription sub-protocols ([`Protocol`]), multiplexes any
//! number of concurrent subscriptions onto it and reconnects transparently
//! when the transport fails. Each subscription is identified by a stable
//! key that survives reconnects; the short-lived wire id is regenerated
//! for every connection and never exposed as the public identifier.
//!
//! ```ignore
//! use graphql_session::{OperationPayload, Protocol, SubscriptionClient};
//!
//! let client = SubscriptionClient::new("http://localhost:8080/v1/graphql")
//!     .with_protocol(Protocol::GraphqlWs)
//!     .with_connection_params(serde_json::json!({
//!         "headers": { "x-hasura-admin-secret": "secret" }
//!     }))
//!     .on_disconnected(|| tracing::info!("disconnected"));
//!
//! let key = client.subscribe(
//!     OperationPayload::query("subscription{helloSaid{id,msg}}"),
//!     |result| {
//!         let data = result?;
//!         println!("{}", String::from_utf8_lossy(data));
//!         Ok(())
//!     },
//! )?;
//!
//! // Blocks until the session terminates; reconnects are transparent.
//! client.run().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod connection;
mod error;
mod protocol;
mod registry;
mod session;

pub use config::{ConnectionParams, RetryPolicy, StatusCodeRange, WebSocketOptions};
pub use error::{BoxError, Error};
pub use protocol::{OperationPayload, Protocol};
pub use registry::{Subscription, SubscriptionHandler, SubscriptionStatus};
pub use session::{SessionHandle, SubscriptionClient};
