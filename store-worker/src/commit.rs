use async_trait::async_trait;

use crate::error::CommitError;
use crate::payload::{Payload, ProjectId};

/// An event that was durably stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: String,
    pub project_id: ProjectId,
}

/// Durable event commit. Implementations store at most one event per
/// (project, event_id) and answer `CommitError::HashDiscarded` for the rest.
#[async_trait]
pub trait EventCommitter: Send + Sync {
    async fn commit(
        &self,
        project_id: ProjectId,
        payload: &Payload,
    ) -> Result<StoredEvent, CommitError>;
}

/// The id an event is committed under: its own, or a freshly minted one.
pub fn committed_event_id(payload: &Payload) -> String {
    match payload.event_id() {
        Some(event_id) => event_id.to_owned(),
        None => uuid::Uuid::now_v7().simple().to_string(),
    }
}
