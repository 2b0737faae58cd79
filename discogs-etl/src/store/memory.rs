use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::EtlResult;
use crate::state::StateMarker;
use crate::store::StateMarkerStore;
use crate::types::DataType;

#[derive(Debug, Default)]
struct Inner {
    markers: HashMap<DataType, StateMarker>,
    /// Every saved marker in save order.
    history: Vec<StateMarker>,
}

/// In-memory marker store. Progress is lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateMarkerStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every marker saved for `data_type`, oldest first.
    pub async fn saved_markers(&self, data_type: DataType) -> Vec<StateMarker> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .filter(|marker| marker.data_type == data_type)
            .cloned()
            .collect()
    }
}

impl StateMarkerStore for MemoryStateMarkerStore {
    async fn load(&self, data_type: DataType) -> EtlResult<Option<StateMarker>> {
        let inner = self.inner.lock().await;
        Ok(inner.markers.get(&data_type).cloned())
    }

    async fn save(&self, marker: &StateMarker) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.markers.insert(marker.data_type, marker.clone());
        inner.history.push(marker.clone());

        Ok(())
    }
}
