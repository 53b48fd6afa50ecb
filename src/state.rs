use crate::{pipeline::Pipeline, services::storage_service::StorageService};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub pipeline: Pipeline,
}
