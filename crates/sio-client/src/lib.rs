//! Typed, thread-safe session API over a hosted protocol client.
//!
//! A [`Session`] owns one script engine on its own thread. Lifecycle
//! notifications and subscribed events are delivered to observers on a
//! separate observer thread; `send`, `subscribe` and `close` may be called
//! from anywhere.

pub mod marshal;
pub mod observers;
pub mod registry;
pub mod script;
pub mod session;
pub mod stats;

pub use marshal::MarshalError;
pub use registry::{EventHandler, Subscription};
pub use session::{Session, SessionOptions};
pub use stats::StatsSnapshot;
