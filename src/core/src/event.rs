//! Broadcast events pushed to connected browsers.
//!
//! Every event travels as one JSON text frame of the form
//! `{"type": <message type>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pod::{PodKey, PodRecord};

/// Message type carrying pods the browser should run.
pub const SCHEDULE_PODS: &str = "schedulePods";

/// Message type carrying keys of pods the browser should stop.
pub const DELETE_PODS: &str = "deletePods";

/// Wire envelope of a broadcast frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: serde_json::Value,
}

/// Event delivered to one or all subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// A single pod was created or updated.
    PodScheduled(PodRecord),
    /// Full current pod set, sent on subscribe.
    Snapshot(Vec<PodRecord>),
    /// A pod was removed from the node.
    PodDeleted(PodKey),
}

impl BroadcastEvent {
    /// Build the wire envelope for this event.
    ///
    /// Scheduled pods and snapshots share the `schedulePods` type and always
    /// carry an array, so the browser handles both the same way.
    pub fn to_message(&self) -> Result<Message> {
        let (message_type, data) = match self {
            Self::PodScheduled(pod) => (SCHEDULE_PODS, serde_json::to_value([pod])?),
            Self::Snapshot(pods) => (SCHEDULE_PODS, serde_json::to_value(pods)?),
            Self::PodDeleted(key) => (DELETE_PODS, serde_json::to_value([key])?),
        };
        Ok(Message {
            message_type: message_type.to_string(),
            data,
        })
    }

    /// Serialize to the JSON text frame sent over the socket.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_message()?)?)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PodScheduled(_) => "pod_scheduled",
            Self::Snapshot(_) => "snapshot",
            Self::PodDeleted(_) => "pod_deleted",
        }
    }
}
