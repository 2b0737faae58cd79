use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::state::SourceIdentity;
use crate::types::DataType;

/// A dump file selected for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFile {
    pub data_type: DataType,
    pub path: PathBuf,
    /// Release date from the file name, `YYYYMMDD`.
    pub version: String,
    pub identity: SourceIdentity,
}

impl DumpFile {
    pub fn file_name(&self) -> &str {
        &self.identity.file_name
    }
}

/// Parses `discogs_YYYYMMDD_<type>.xml.gz` into its version and data type.
pub fn parse_dump_file_name(file_name: &str) -> Option<(String, DataType)> {
    let stem = file_name.strip_suffix(".xml.gz")?;
    let rest = stem.strip_prefix("discogs_")?;
    let (version, data_type) = rest.split_once('_')?;

    if version.len() != 8 || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let data_type = data_type.parse::<DataType>().ok()?;

    Some((version.to_string(), data_type))
}

/// Finds the newest dump of every requested data type in `data_dir`.
///
/// Data types without a dump are left out of the result.
pub async fn discover_dumps(data_dir: &Path, data_types: &[DataType]) -> EtlResult<Vec<DumpFile>> {
    let mut entries = tokio::fs::read_dir(data_dir).await.map_err(|err| {
        etl_error!(
            ErrorKind::IoError,
            "Failed to read the data directory",
            data_dir.display(),
            source: err
        )
    })?;

    let mut newest: BTreeMap<DataType, (String, PathBuf)> = BTreeMap::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some((version, data_type)) = parse_dump_file_name(&file_name) else {
            continue;
        };
        if !data_types.contains(&data_type) {
            debug!(file = %file_name, "ignoring dump of a data type that is not configured");
            continue;
        }

        let replace = match newest.get(&data_type) {
            Some((current, _)) => version > *current,
            None => true,
        };
        if replace {
            newest.insert(data_type, (version, entry.path()));
        }
    }

    let mut dumps = Vec::with_capacity(newest.len());
    for (data_type, (version, path)) in newest {
        let metadata = tokio::fs::metadata(&path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        info!(%data_type, file = %file_name, size_bytes = metadata.len(), "discovered dump file");

        dumps.push(DumpFile {
            data_type,
            identity: SourceIdentity::new(file_name, metadata.len()),
            version,
            path,
        });
    }

    Ok(dumps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::archive::{dump_xml, write_dump};

    #[test]
    fn test_parse_dump_file_name() {
        assert_eq!(
            parse_dump_file_name("discogs_20250101_artists.xml.gz"),
            Some(("20250101".to_string(), DataType::Artists))
        );
        assert_eq!(parse_dump_file_name("discogs_20250101_artists.xml"), None);
        assert_eq!(parse_dump_file_name("discogs_2025_artists.xml.gz"), None);
        assert_eq!(parse_dump_file_name("discogs_20250101_tracks.xml.gz"), None);
        assert_eq!(parse_dump_file_name("discogs_20250101_CHECKSUM.txt"), None);
    }

    #[tokio::test]
    async fn test_newest_dump_per_data_type_wins() {
        let dir = tempfile::tempdir().unwrap();
        let artists = dump_xml(DataType::Artists, &[("1", "A")]);
        write_dump(dir.path(), "discogs_20250101_artists.xml.gz", &artists);
        write_dump(dir.path(), "discogs_20250201_artists.xml.gz", &artists);
        write_dump(
            dir.path(),
            "discogs_20250301_labels.xml.gz",
            &dump_xml(DataType::Labels, &[("1", "L")]),
        );
        std::fs::write(dir.path().join("README.txt"), "not a dump").unwrap();

        let dumps = discover_dumps(dir.path(), &[DataType::Artists, DataType::Masters])
            .await
            .unwrap();

        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].data_type, DataType::Artists);
        assert_eq!(dumps[0].version, "20250201");
        assert_eq!(dumps[0].file_name(), "discogs_20250201_artists.xml.gz");
        assert!(dumps[0].identity.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_missing_data_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_dumps(&dir.path().join("missing"), &DataType::ALL)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }
}
