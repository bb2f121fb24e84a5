use keel_core::machine::DeploymentStateMachine;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub machine: DeploymentStateMachine,
    /// Attempts whose approval is being driven by a background task.
    driving: Arc<Mutex<HashSet<u64>>>,
}

impl AppState {
    pub fn new(machine: DeploymentStateMachine) -> Self {
        Self {
            machine,
            driving: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open the project at `root`. Holds the database lock for the
    /// lifetime of the process.
    pub fn open(root: &Path) -> keel_core::Result<Self> {
        Ok(Self::new(DeploymentStateMachine::from_project(root)?))
    }

    /// Mark `id` as being driven. Returns false if it already is.
    pub fn begin_drive(&self, id: u64) -> bool {
        self.driving
            .lock()
            .map(|mut set| set.insert(id))
            .unwrap_or(false)
    }

    pub fn end_drive(&self, id: u64) {
        if let Ok(mut set) = self.driving.lock() {
            set.remove(&id);
        }
    }
}
