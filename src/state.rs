use std::sync::Arc;

use crate::admission::Admission;
use crate::config::Config;
use crate::events::EventBus;
use crate::service::JobService;
use crate::store::Store;

/// Shared handles wired into the HTTP surface. The event bus and admission
/// state are explicit collaborators, not ambient globals; the same
/// instances are handed to the worker pool.
pub struct AppState {
    pub store: Store,
    pub admission: Arc<Admission>,
    pub events: EventBus,
    pub service: JobService,
}

impl AppState {
    pub fn new(config: &Config, store: Store) -> Self {
        let admission = Arc::new(Admission::new());
        let events = EventBus::new(config.event_bus_capacity);
        let service = JobService::new(
            store.clone(),
            admission.clone(),
            events.clone(),
            config.worker_max_retries,
        );

        Self {
            store,
            admission,
            events,
            service,
        }
    }
}
