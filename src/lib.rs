//! TCP man-in-the-middle proxy for exercising anomaly detection.
//!
//! ```text
//!  client ──▶ Listener ──▶ Session ──┬─▶ Forwarder (client → server) ──▶ upstream
//!                                    └─▶ Forwarder (server → client) ──▶ client
//!                                              │
//!                                              ▼
//!                                           Shaper (transparent / delay / drop / reorder)
//! ```
//!
//! Bytes are relayed as opaque chunks; no framing is imposed or expected.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod listener;
pub mod message;
pub mod session;
pub mod shaper;
pub mod stats;

pub use config::{AttackMode, ProxyConfig, ShaperConfig};
pub use error::{ProxyError, Result};
pub use forwarder::{Direction, Forwarder};
pub use listener::Listener;
pub use session::{Session, SessionLink};
pub use shaper::{ReorderBuffer, Shaped, Shaper};
pub use stats::Stats;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
