use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{EtlError, ErrorKind};

/// Entity kind of a Discogs dump. Each data type has its own dump file, state marker,
/// queue and consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Artists,
    Labels,
    Masters,
    Releases,
}

impl DataType {
    pub const ALL: [DataType; 4] = [
        DataType::Artists,
        DataType::Labels,
        DataType::Masters,
        DataType::Releases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Artists => "artists",
            DataType::Labels => "labels",
            DataType::Masters => "masters",
            DataType::Releases => "releases",
        }
    }

    /// Name of the xml element holding one record in the dump.
    pub fn record_element(&self) -> &'static str {
        match self {
            DataType::Artists => "artist",
            DataType::Labels => "label",
            DataType::Masters => "master",
            DataType::Releases => "release",
        }
    }

    /// Node label used by the graph sink.
    pub fn node_label(&self) -> &'static str {
        match self {
            DataType::Artists => "Artist",
            DataType::Labels => "Label",
            DataType::Masters => "Master",
            DataType::Releases => "Release",
        }
    }

    /// Parses a list of configured data type names.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<DataType>, EtlError> {
        names.iter().map(|name| name.as_ref().parse()).collect()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "artists" => Ok(DataType::Artists),
            "labels" => Ok(DataType::Labels),
            "masters" => Ok(DataType::Masters),
            "releases" => Ok(DataType::Releases),
            other => bail!(
                ErrorKind::ValidationError,
                "Unsupported data type",
                format!("`{other}` is not one of artists, labels, masters, releases")
            ),
        }
    }
}
