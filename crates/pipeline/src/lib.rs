pub mod campaign;
pub mod error;
pub mod payload;
pub mod reconcile;
pub mod send;
pub mod sms_worker;

pub use campaign::CampaignSendHandler;
pub use error::PipelineError;
pub use payload::{CampaignJobPayload, SmsJobPayload};
pub use reconcile::{InboundOutcome, Reconciler, ReconcilerConfig, StatusOutcome};
pub use send::{SendOutcome, SendService, SmsSendRequest};
pub use sms_worker::SmsSendHandler;
