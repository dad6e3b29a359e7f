pub mod config;
pub mod error;
pub mod provider;
pub mod types;
pub mod verify;

pub use config::TelnyxConfig;
pub use error::TelnyxError;
pub use provider::TelnyxProvider;
pub use types::{CreateMessageRequest, CreateMessageResponse};
pub use verify::{DEFAULT_TOLERANCE, WebhookVerifier, WebhookVerifyError};
