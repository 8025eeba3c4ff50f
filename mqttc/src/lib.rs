//! # mqttc
//!
//! MQTT 3.1.1 client protocol engine.
//!
//! - Byte-exact packet codec for all 14 control packet types
//! - QoS 0, 1 and 2 in both directions
//! - Subscriptions that activate only after the broker's SUBACK
//! - Keepalive, reconnect, and resubscribe when the broker lost the session
//! - Pluggable [`Platform`] for transport, tasks and timers (tokio by default)
//!
//! ## Example
//!
//! ```no_run
//! use mqttc::{Client, ClientConfig, Message, QoS};
//!
//! # async fn example() -> mqttc::Result<()> {
//! let client = Client::builder(ClientConfig::new("127.0.0.1", "sensor-1"))
//!     .on_error(|e| {
//!         eprintln!("connection lost: {}", e);
//!         false
//!     })
//!     .build();
//! client.connect().await?;
//!
//! client
//!     .subscribe("cmd/sensor-1", QoS::AtLeastOnce, |msg: &Message| {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!     })
//!     .await?;
//!
//! client.publish("data/sensor-1", "21.5", QoS::AtLeastOnce).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;

pub mod buffer;
pub mod pending;
pub mod platform;
pub mod protocol;
pub mod subscriptions;
pub mod types;

pub use buffer::Buffer;
pub use client::{Client, ClientBuilder, Completion, ConnectedCallback, ErrorHandler, State};
pub use config::{ClientConfig, DEFAULT_KEEP_ALIVE, DEFAULT_PORT, MAX_PACKET_SIZE};
pub use error::{Error, Result};
pub use platform::{BoxStream, Platform, TaskHandle, TimerHandle, TokioPlatform, Transport};
pub use types::{Handler, LastWill, Message, QoS};
