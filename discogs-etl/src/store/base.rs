use std::future::Future;

use crate::error::EtlResult;
use crate::state::{ProcessingDecision, SourceIdentity, StateMarker};
use crate::types::DataType;

/// Trait for persisting extraction progress.
///
/// One marker is stored per data type and every save fully supersedes the previous marker.
/// Implementations must make [`StateMarkerStore::save`] atomic: a reader observes either the
/// previous marker or the new one, never a partial write.
pub trait StateMarkerStore {
    /// Returns the stored marker of `data_type`, or `None` if the data type was never processed.
    fn load(&self, data_type: DataType) -> impl Future<Output = EtlResult<Option<StateMarker>>> + Send;

    fn save(&self, marker: &StateMarker) -> impl Future<Output = EtlResult<()>> + Send;

    /// Decides whether the file identified by `source_identity` must be skipped, resumed or
    /// processed from the start.
    ///
    /// A forced reprocess does not read the stored marker, so a corrupted marker cannot block it.
    fn should_skip(
        &self,
        data_type: DataType,
        source_identity: &SourceIdentity,
        force_reprocess: bool,
    ) -> impl Future<Output = EtlResult<ProcessingDecision>> + Send
    where
        Self: Sync,
    {
        async move {
            if force_reprocess {
                return Ok(ProcessingDecision::Reprocess);
            }

            let marker = self.load(data_type).await?;
            Ok(StateMarker::decide(
                marker.as_ref(),
                source_identity,
                force_reprocess,
            ))
        }
    }
}
