//! Services - bridge logic and state management
//!
//! - `topic_resolver` - which topics to subscribe for the registered devices
//! - `connection` - broker connection lifecycle actor
//! - `classifier` - decides which inbound messages are telemetry
//! - `hub` - push client registry, fan-out and liveness
//! - `bridge` - composition root and management operations

pub mod bridge;
pub mod classifier;
pub mod connection;
pub mod hub;
pub mod topic_resolver;

// Re-export commonly used types
pub use bridge::{AddDeviceOutcome, Bridge};
pub use classifier::{MessageClassifier, TelemetrySink};
pub use connection::{ConnectionManager, LifecycleEvent, ManagerSettings};
pub use hub::{BroadcastHub, ClientConnection, Outbound};
pub use topic_resolver::{SubscriptionSet, TopicResolver};
