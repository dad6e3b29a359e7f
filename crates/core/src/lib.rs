pub mod campaign;
pub mod channel;
pub mod contact;
pub mod error;
pub mod location;
pub mod message;
pub mod optout;
pub mod phone;
pub mod types;

pub use campaign::{Campaign, CampaignKind, CampaignStatus, CounterField};
pub use channel::Channel;
pub use contact::{ConsentMethod, Contact};
pub use error::LeaflineError;
pub use location::Location;
pub use message::{Direction, Message, MessageStatus};
pub use optout::{GlobalOptOut, OptAction, OptOutLogEntry};
pub use phone::{looks_like_e164, normalize};
pub use types::{CampaignId, ContactId, JobId, LocationId, MessageId, TenantId};
