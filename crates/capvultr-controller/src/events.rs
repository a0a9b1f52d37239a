//! Progress events
//!
//! Reconcilers report notable transitions (created, attached, ready, failed)
//! through an [`EventRecorder`]. The default recorder turns them into
//! `tracing` events.

use crate::error::Target;

pub const LOAD_BALANCER_CREATED: &str = "LoadBalancerCreated";
pub const LOAD_BALANCER_DELETED: &str = "LoadBalancerDeleted";
pub const CLUSTER_READY: &str = "ClusterReady";
pub const INSTANCE_CREATED: &str = "InstanceCreated";
pub const INSTANCE_CREATE_FAILED: &str = "InstanceCreateFailed";
pub const INSTANCE_ATTACHED: &str = "InstanceAttached";
pub const INSTANCE_READY: &str = "InstanceReady";
pub const INSTANCE_FAILED: &str = "InstanceFailed";
pub const INSTANCE_DELETED: &str = "InstanceDeleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, target: &Target, event_type: EventType, reason: &str, message: &str);

    fn normal(&self, target: &Target, reason: &str, message: &str) {
        self.record(target, EventType::Normal, reason, message);
    }

    fn warning(&self, target: &Target, reason: &str, message: &str) {
        self.record(target, EventType::Warning, reason, message);
    }
}

/// Emits events as `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, target: &Target, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => {
                tracing::info!(kind = target.kind, key = %target.key, reason, "{}", message)
            }
            EventType::Warning => {
                tracing::warn!(kind = target.kind, key = %target.key, reason, "{}", message)
            }
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::{RecordedEvent, RecordingRecorder};

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use super::{EventRecorder, EventType};
    use crate::error::Target;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        pub target: Target,
        pub event_type: EventType,
        pub reason: String,
        pub message: String,
    }

    /// Keeps every event for later assertions
    #[derive(Debug, Default)]
    pub struct RecordingRecorder {
        events: Mutex<Vec<RecordedEvent>>,
    }

    impl RecordingRecorder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<RecordedEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }

        pub fn reasons(&self) -> Vec<String> {
            self.events().into_iter().map(|e| e.reason).collect()
        }
    }

    impl EventRecorder for RecordingRecorder {
        fn record(&self, target: &Target, event_type: EventType, reason: &str, message: &str) {
            if let Ok(mut events) = self.events.lock() {
                events.push(RecordedEvent {
                    target: target.clone(),
                    event_type,
                    reason: reason.to_string(),
                    message: message.to_string(),
                });
            }
        }
    }
}
