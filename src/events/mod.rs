//! Activity events: ordered per-user publish, pattern subscriptions and replay

pub mod pattern;
pub mod publisher;
pub mod stream;

pub use pattern::ChannelPattern;
pub use publisher::{ActivityPublisher, Subscription, SubscriptionError};
pub use stream::ActivityStream;
