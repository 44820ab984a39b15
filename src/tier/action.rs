use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quota bucket consumed by a tool operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Conversion,
    Compression,
    Enhancement,
    Identification,
    MetadataEdit,
    GifCreation,
    Transcription,
    Translation,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::Conversion,
        ActionType::Compression,
        ActionType::Enhancement,
        ActionType::Identification,
        ActionType::MetadataEdit,
        ActionType::GifCreation,
        ActionType::Transcription,
        ActionType::Translation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Conversion => "conversion",
            ActionType::Compression => "compression",
            ActionType::Enhancement => "enhancement",
            ActionType::Identification => "identification",
            ActionType::MetadataEdit => "metadata_edit",
            ActionType::GifCreation => "gif_creation",
            ActionType::Transcription => "transcription",
            ActionType::Translation => "translation",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown action type: {0}")]
pub struct UnknownActionType(pub String);

impl FromStr for ActionType {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        ActionType::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| UnknownActionType(s.to_string()))
    }
}
