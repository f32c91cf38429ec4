pub mod retry;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use retry::{is_retryable, RetryPolicy, RETRYABLE_MARKER};

/// Ability descriptions carrying this exact text are scraper filler and must
/// never reach a rendered document.
pub const PLACEHOLDER_DESCRIPTION: &str = "Placeholder";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AbilityType {
    Basic,
    Special,
    Unique,
    Leader,
    Ultimate,
}

impl AbilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Special => "Special",
            Self::Unique => "Unique",
            Self::Leader => "Leader",
            Self::Ultimate => "Ultimate",
        }
    }
}

impl fmt::Display for AbilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbilityRecord {
    #[serde(rename = "ability_name")]
    pub name: String,
    pub ability_type: AbilityType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown_link: Option<String>,
    #[serde(default)]
    pub is_zeta: bool,
    #[serde(default)]
    pub is_omicron: bool,
    #[serde(default)]
    pub is_ultimate: bool,
}

impl AbilityRecord {
    pub fn is_placeholder(&self) -> bool {
        self.description.trim() == PLACEHOLDER_DESCRIPTION
    }

    /// Bracketed upgrade marker for retrieval documents.
    ///
    /// Precedence is Zeta+Omicron, then Zeta, then Omicron, then Ultimate.
    /// `is_ultimate` only shows when neither Zeta nor Omicron is set, and the
    /// `Ultimate` ability type alone never produces a marker.
    pub fn elite_marker(&self) -> Option<&'static str> {
        match (self.is_zeta, self.is_omicron, self.is_ultimate) {
            (true, true, _) => Some("[Zeta,Omicron]"),
            (true, false, _) => Some("[Zeta]"),
            (false, true, _) => Some("[Omicron]"),
            (false, false, true) => Some("[Ultimate]"),
            (false, false, false) => None,
        }
    }
}

/// One row of the scraped character list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitListing {
    pub name: String,
    #[serde(rename = "character_url")]
    pub identifier: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Full per-character record, keyed by the same identifier as [`UnitListing`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CharacterDetail {
    #[serde(rename = "character_url")]
    pub identifier: String,
    #[serde(default)]
    pub base_stats: BTreeMap<String, String>,
    #[serde(default)]
    pub ability_classes: Vec<String>,
    #[serde(default)]
    pub abilities: Vec<AbilityRecord>,
    pub mods_data_url: String,
    pub player_data_url: String,
}

impl CharacterDetail {
    pub fn rendered_abilities(&self) -> impl Iterator<Item = &AbilityRecord> {
        self.abilities.iter().filter(|a| !a.is_placeholder())
    }
}

/// Semantic index entry. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CharacterSummary {
    pub identifier: String,
    pub name: String,
    pub tags: Vec<String>,
    pub document: String,
}
