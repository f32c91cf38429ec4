//! Structured store: read-only character records loaded once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use holocron_schema::{CharacterDetail, UnitListing};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate identifier '{identifier}' in {dataset}")]
    DuplicateIdentifier {
        dataset: &'static str,
        identifier: String,
    },
}

/// Name and tags of one character, as shown by roster listings.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnitBrief {
    pub name: String,
    pub tags: Vec<String>,
}

/// The character list plus the per-character detail records, joined by
/// identifier. Lookups are exact; nothing here mutates after load.
#[derive(Debug, Clone)]
pub struct Roster {
    listings: Vec<UnitListing>,
    details: HashMap<String, CharacterDetail>,
}

impl Roster {
    pub fn load(units_path: &Path, details_path: &Path) -> Result<Self, RosterError> {
        let listings: Vec<UnitListing> = read_json(units_path)?;
        let details: Vec<CharacterDetail> = read_json(details_path)?;
        let roster = Self::from_parts(listings, details)?;
        tracing::info!(
            units = roster.listings.len(),
            details = roster.details.len(),
            "roster loaded"
        );
        Ok(roster)
    }

    pub fn from_parts(
        listings: Vec<UnitListing>,
        details: Vec<CharacterDetail>,
    ) -> Result<Self, RosterError> {
        let mut seen = std::collections::HashSet::new();
        for listing in &listings {
            if !seen.insert(listing.identifier.as_str()) {
                return Err(RosterError::DuplicateIdentifier {
                    dataset: "units",
                    identifier: listing.identifier.clone(),
                });
            }
        }

        let mut by_id = HashMap::with_capacity(details.len());
        for detail in details {
            if by_id.contains_key(&detail.identifier) {
                return Err(RosterError::DuplicateIdentifier {
                    dataset: "character details",
                    identifier: detail.identifier,
                });
            }
            by_id.insert(detail.identifier.clone(), detail);
        }

        Ok(Self {
            listings,
            details: by_id,
        })
    }

    pub fn get_detail(&self, identifier: &str) -> Option<&CharacterDetail> {
        self.details.get(identifier)
    }

    pub fn listings(&self) -> &[UnitListing] {
        &self.listings
    }

    pub fn summaries(&self) -> Vec<UnitBrief> {
        self.listings
            .iter()
            .map(|l| UnitBrief {
                name: l.name.clone(),
                tags: l.tags.clone(),
            })
            .collect()
    }

    /// First listing whose name contains `query`, ignoring case.
    pub fn find_by_name(&self, query: &str) -> Option<&UnitListing> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.listings
            .iter()
            .find(|l| l.name.to_lowercase().contains(&needle))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.details.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RosterError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RosterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RosterError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
