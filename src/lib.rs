pub mod amazon;
pub mod client;
pub mod config;
pub mod dates;
pub mod engine;
pub mod extract;
pub mod message;

pub use client::{FileMailClient, MailClient, MailError, MessageId};
pub use config::{AmazonProfile, CarrierProfile, Config};
pub use engine::{CycleState, Evaluation, MetricValue, SensorEngine};
pub use message::MessageRecord;
