pub mod config;
pub mod errors;
pub mod ids;
pub mod lifecycle;
pub mod settings;
pub mod state;
pub mod value;

pub use config::{AttemptLimit, SessionConfig, Transport};
pub use errors::{BridgeError, ConfigError, SettingsError};
pub use ids::{EventIdentifier, SessionId};
pub use lifecycle::{ErrorPayload, LifecycleEvent, LifecycleKind};
pub use settings::Settings;
pub use state::SessionState;
pub use value::Value;
