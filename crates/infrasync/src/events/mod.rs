//! Tenant events and the in-process router that distributes them.

pub mod router;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use router::EventRouter;

/// Discriminant of a [`TenantEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    RepositoryUpdate,
    SynchronizationRequest,
    StatusUpdate,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::RepositoryUpdate => write!(f, "RepositoryUpdate"),
            EventType::SynchronizationRequest => write!(f, "SynchronizationRequest"),
            EventType::StatusUpdate => write!(f, "StatusUpdate"),
        }
    }
}

/// An event concerning one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TenantEvent {
    /// The tenant branch moved to a new commit.
    #[serde(rename_all = "camelCase")]
    RepositoryUpdate {
        tenant: String,
        commit_ref: String,
        /// Set by writers that already applied the change to the cluster.
        #[serde(default)]
        already_applied: bool,
    },

    /// Ask for a full convergence pass.
    #[serde(rename_all = "camelCase")]
    SynchronizationRequest { tenant: String, request_id: String },

    /// Status of a live resource, for reporting collaborators.
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        tenant: String,
        resource: String,
        status: String,
    },
}

impl TenantEvent {
    pub fn repository_update(
        tenant: impl Into<String>,
        commit_ref: impl Into<String>,
        already_applied: bool,
    ) -> Self {
        TenantEvent::RepositoryUpdate {
            tenant: tenant.into(),
            commit_ref: commit_ref.into(),
            already_applied,
        }
    }

    /// A sync request with a fresh id, so it is never deduplicated away.
    pub fn synchronization_request(tenant: impl Into<String>) -> Self {
        TenantEvent::SynchronizationRequest {
            tenant: tenant.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn tenant(&self) -> &str {
        match self {
            TenantEvent::RepositoryUpdate { tenant, .. }
            | TenantEvent::SynchronizationRequest { tenant, .. }
            | TenantEvent::StatusUpdate { tenant, .. } => tenant,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            TenantEvent::RepositoryUpdate { .. } => EventType::RepositoryUpdate,
            TenantEvent::SynchronizationRequest { .. } => EventType::SynchronizationRequest,
            TenantEvent::StatusUpdate { .. } => EventType::StatusUpdate,
        }
    }

    /// Identity used by the router's recently-seen cache.
    pub fn dedup_key(&self) -> String {
        match self {
            TenantEvent::RepositoryUpdate { commit_ref, .. } => commit_ref.clone(),
            TenantEvent::SynchronizationRequest { request_id, .. } => request_id.clone(),
            TenantEvent::StatusUpdate {
                resource, status, ..
            } => format!("{}:{}", resource, status),
        }
    }

    /// JSON rendering of the event.
    pub fn body(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_update_json() {
        let event = TenantEvent::repository_update("alpha", "abc123", true);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"repositoryUpdate\""));
        assert!(json.contains("\"commitRef\":\"abc123\""));
        assert!(json.contains("\"alreadyApplied\":true"));

        let parsed: TenantEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_accessors() {
        let event = TenantEvent::StatusUpdate {
            tenant: "beta".to_string(),
            resource: "Box/codec".to_string(),
            status: "Running".to_string(),
        };
        assert_eq!(event.tenant(), "beta");
        assert_eq!(event.event_type(), EventType::StatusUpdate);
        assert_eq!(event.dedup_key(), "Box/codec:Running");
        assert_eq!(event.body()["tenant"], "beta");
    }

    #[test]
    fn test_sync_requests_are_distinct() {
        let a = TenantEvent::synchronization_request("alpha");
        let b = TenantEvent::synchronization_request("alpha");
        assert_ne!(a.dedup_key(), b.dedup_key());
    }
}
