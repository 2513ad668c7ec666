//! # Resilient MQTT Client for Embedded Systems
//!
//! `homelink-mqtt` is a `no_std` compatible, asynchronous MQTT 3.1.1 client
//! built on the [Embassy](https://embassy.dev/) async ecosystem, aimed at
//! devices that must stay subscribed across flaky links without any
//! application involvement.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Designed to run on bare-metal microcontrollers without requiring a
//!   standard library or dynamic memory allocation. Buffers are managed using `heapless`.
//! - **Fully Async:** Built with `async/await` and leverages the Embassy ecosystem for timers
//!   and networking, ensuring non-blocking operations.
//! - **Self-healing:** The network task reconnects with exponential backoff and
//!   re-establishes every tracked subscription on its own; subscriptions are
//!   desired state, not one-shot requests.
//! - **Transport Agnostic:** A flexible `MqttTransport` trait allows the client to run over any
//!   reliable, ordered, stream-based communication channel, including TCP, UART, or SPI.
//! - **QoS 0, 1 & 2** for outgoing publishes, with callers blocked until the
//!   broker acknowledges delivery.
//!
//! ## Architecture
//!
//! All protocol state lives with a single network task; application tasks get
//! a copyable [`MqttHandle`] that ships owned requests over a channel and
//! waits on a completion signal:
//!
//! ```ignore
//! static STATE: StaticCell<MqttState> = StaticCell::new();
//!
//! let state = STATE.init(MqttState::new());
//! let (mut client, handle) = state.split::<_, 8>(transport, MqttOptions::new("device-1"));
//!
//! // Network task:
//! client.run().await;
//!
//! // Any other task:
//! handle.subscribe("home/+/set", QoS::AtLeastOnce, &HANDLER).await?;
//! handle.publish("home/door/state", b"open", QoS::AtLeastOnce, false).await?;
//! ```
//!
//! Messages are delivered to the [`MessageHandler`] registered with each
//! subscription filter, on the network task, with the payload reassembled
//! even when it arrived fragmented across transport reads.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible crate-wide.
mod fmt;

pub mod client;
mod completion;
pub mod error;
pub mod handle;
pub mod matcher;
pub mod packet;
pub mod shared;
pub mod transport;
pub mod util;

mod backoff;
mod reassembly;
mod subscription;

// Re-export key types for easier access at the crate root.
pub use client::{LastWill, MqttClient, MqttOptions, MqttState};
pub use error::{ClientError, MqttError};
pub use handle::{Message, MessageHandler, MqttHandle};
pub use packet::QoS;
pub use shared::Shared;
pub use subscription::MAX_TOPIC_LEN;
pub use transport::{BrokerAddress, MqttTransport, TcpTransport};
