//! Delivery of transitions and ticket results to observers

pub mod publisher;

pub use publisher::{
    ChannelObserver, EventPublisher, MatchmakingObserver, RecordingObserver, SubscriptionHandle,
};
