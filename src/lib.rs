#![cfg_attr(doc, doc = include_str!("../README.md"))]

//! # Architecture
//!
//! - [`ConnectionManager`]: the orchestrator -- state machine, heartbeat/retry
//!   loop, reconnection with exponential backoff, and the send/receive/handler
//!   API
//! - [`MessageQueue`]: pending FIFO, unconfirmed map and inbound
//!   de-duplication set behind the at-least-once contract
//! - [`NetworkMonitor`]: reachability probing that drives automatic recovery
//! - [`Transport`] / [`TransportFactory`]: the seam to the underlying duplex
//!   stream; [`WsFactory`] is the stock tokio-tungstenite implementation
//! - [`ManagerRegistry`]: session-id scoped lookup of managers

pub mod compress;
pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod transport;

pub use config::{ConnectionConfig, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, HEARTBEAT_ACK_TYPE, HEARTBEAT_TYPE};
pub use error::{DeliveryExhausted, Error, Kind};
pub use monitor::NetworkMonitor;
pub use queue::{Envelope, Message, MessageQueue};
pub use registry::ManagerRegistry;
pub use transport::{Frame, Transport, TransportFactory, WsFactory, WsTransport};

pub type Result<T> = std::result::Result<T, Error>;
