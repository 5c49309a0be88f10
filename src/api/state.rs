use std::sync::Arc;

use crate::queue::TestQueue;
use crate::storage::RunStore;
use crate::stream::StreamReconciler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub queue: TestQueue,
    pub streams: StreamReconciler,
}
