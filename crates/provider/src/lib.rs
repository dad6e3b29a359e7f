pub mod error;
pub mod provider;
pub mod testing;

pub use error::ProviderError;
pub use provider::{SendReceipt, SmsFrom, SmsProvider};
pub use testing::ScriptedProvider;
