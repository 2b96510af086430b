use std::sync::Arc;

use annoq_lib::{JobManager, Reconciler};

/// Shared application state managed by Rocket.
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>) -> Self {
        let reconciler = Reconciler::new(manager.clone());
        Self {
            manager,
            reconciler,
        }
    }
}
