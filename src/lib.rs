//! Command relay broker.
//!
//! Callers enqueue commands and wait for their results; an agent that can
//! only make outbound requests drains the queue and posts results back. The
//! broker correlates the two by command id and keeps the public endpoint
//! reachable through whichever tunnel provider is currently healthy.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use command_relay::broker::{Broker, BrokerSettings};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let broker = Broker::new(BrokerSettings::default());
//! let _sweeper = broker.start();
//! let result = broker
//!     .enqueue_and_wait("ECHO", json!({ "text": "hi" }), Duration::from_secs(5))
//!     .await;
//! if !result.success {
//!     eprintln!("command failed: {:?}", result.error);
//! }
//! # }
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod correlator;
pub mod events;
pub mod liveness;
pub mod protocol;
pub mod queue;
pub mod selector;
pub mod transport;
pub mod tunnel;
