use crate::core::traits::QueryService;
use std::sync::Arc;

pub mod generate;

/// Handles to everything the request handlers need, built explicitly in
/// `main` and cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub query_service: Arc<dyn QueryService>,
}

impl AppState {
    pub fn new(query_service: Arc<dyn QueryService>) -> AppState {
        AppState { query_service }
    }
}
