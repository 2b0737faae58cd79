use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::state::StateMarker;
use crate::store::StateMarkerStore;
use crate::types::DataType;

/// Stores one JSON marker file per data type in a directory.
///
/// Saves write a temporary sibling file, sync it and rename it over the marker, so a crash
/// mid-write leaves the previous marker intact.
#[derive(Debug, Clone)]
pub struct FileStateMarkerStore {
    directory: PathBuf,
}

impl FileStateMarkerStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn marker_path(&self, data_type: DataType) -> PathBuf {
        self.directory.join(format!("{data_type}.state.json"))
    }

    fn temporary_path(path: &Path) -> PathBuf {
        let mut temporary = path.as_os_str().to_owned();
        temporary.push(".tmp");
        PathBuf::from(temporary)
    }
}

impl StateMarkerStore for FileStateMarkerStore {
    async fn load(&self, data_type: DataType) -> EtlResult<Option<StateMarker>> {
        let path = self.marker_path(data_type);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let marker: StateMarker = serde_json::from_slice(&bytes).map_err(|err| {
            etl_error!(
                ErrorKind::StateMarkerCorrupted,
                "State marker file cannot be parsed",
                path.display(),
                source: err
            )
        })?;

        if marker.data_type != data_type {
            return Err(etl_error!(
                ErrorKind::StateMarkerCorrupted,
                "State marker file belongs to another data type",
                format!("{} holds {}", path.display(), marker.data_type)
            ));
        }

        Ok(Some(marker))
    }

    async fn save(&self, marker: &StateMarker) -> EtlResult<()> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let path = self.marker_path(marker.data_type);
        let temporary_path = Self::temporary_path(&path);
        let bytes = serde_json::to_vec_pretty(marker)?;

        let mut file = tokio::fs::File::create(&temporary_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temporary_path, &path).await?;

        // Persist the rename itself.
        match tokio::fs::File::open(&self.directory).await {
            Ok(directory) => {
                if let Err(err) = directory.sync_all().await {
                    warn!(error = %err, directory = %self.directory.display(), "failed to sync state directory");
                }
            }
            Err(err) => {
                warn!(error = %err, directory = %self.directory.display(), "failed to open state directory for sync");
            }
        }

        debug!(
            data_type = %marker.data_type,
            offset = marker.offset,
            total_records = marker.total_records,
            completed = marker.completed,
            "state marker saved"
        );

        Ok(())
    }
}
