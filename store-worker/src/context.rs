use tracing::{info_span, Span};

use crate::payload::ProjectId;

/// The project and event a stage is working on. Passed explicitly to every
/// plugin call and recorded on the stage's tracing span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub project_id: ProjectId,
    pub event_id: Option<String>,
}

impl EventContext {
    pub fn new(project_id: ProjectId, event_id: Option<&str>) -> Self {
        Self {
            project_id,
            event_id: event_id.map(str::to_owned),
        }
    }

    pub fn span(&self, stage: &'static str) -> Span {
        info_span!(
            "stage",
            stage,
            project = self.project_id,
            event_id = self.event_id.as_deref()
        )
    }
}
