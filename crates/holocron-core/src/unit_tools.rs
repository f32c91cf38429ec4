//! The two tools the model may call: semantic unit search and exact
//! character lookup.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use holocron_memory::{Roster, SearchHit, UnitIndex};
use holocron_provider::ToolDef;
use serde::Deserialize;

use crate::tool::{parse_args, ToolExecutor, ToolOutput, ToolRegistry};

pub const FIND_RELEVANT_UNITS: &str = "find_relevant_units";
pub const GET_CHARACTER_DATA: &str = "get_character_data";

/// Returned verbatim when an identifier has no detail record.
pub const NO_DETAIL_FOUND: &str = "No detailed data found for this URL.";

const HIT_SEPARATOR: &str = "\n\n---\n\n";

pub struct FindRelevantUnitsTool {
    index: Arc<UnitIndex>,
    k: usize,
}

impl FindRelevantUnitsTool {
    pub fn new(index: Arc<UnitIndex>, k: usize) -> Self {
        Self { index, k: k.max(1) }
    }
}

#[derive(Debug, Deserialize)]
struct FindRelevantUnitsArgs {
    query: String,
}

/// `Content: <document>\nCharacter URL: <identifier>` blocks in rank order.
pub fn format_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| format!("Content: {}\nCharacter URL: {}", h.document, h.identifier))
        .collect::<Vec<_>>()
        .join(HIT_SEPARATOR)
}

#[async_trait]
impl ToolExecutor for FindRelevantUnitsTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: FIND_RELEVANT_UNITS.into(),
            description: "Semantic search over every character's summary (name, tags, ability \
                classes and abilities). Use it for team building, counters, synergies or to \
                discover which characters match a role. Returns each match with its Character \
                URL, which get_character_data accepts."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural-language description of the characters you need"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutput> {
        let args: FindRelevantUnitsArgs = parse_args(FIND_RELEVANT_UNITS, input)?;
        let hits = self.index.search(&args.query, self.k).await?;
        tracing::debug!(query = %args.query, hits = hits.len(), "unit search");
        Ok(ToolOutput::ok(format_hits(&hits)))
    }
}

pub struct GetCharacterDataTool {
    roster: Arc<Roster>,
}

impl GetCharacterDataTool {
    pub fn new(roster: Arc<Roster>) -> Self {
        Self { roster }
    }
}

#[derive(Debug, Deserialize)]
struct GetCharacterDataArgs {
    #[serde(alias = "identifier")]
    character_url: String,
}

#[async_trait]
impl ToolExecutor for GetCharacterDataTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: GET_CHARACTER_DATA.into(),
            description: "Full record for one character: base stats, ability classes, every \
                ability with its Zeta/Omicron/Ultimate flags, plus the mods and player data \
                links. Pass the exact Character URL returned by find_relevant_units."
                .into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "character_url": {
                        "type": "string",
                        "description": "Exact Character URL of the unit"
                    }
                },
                "required": ["character_url"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutput> {
        let args: GetCharacterDataArgs = parse_args(GET_CHARACTER_DATA, input)?;
        match self.roster.get_detail(&args.character_url) {
            Some(detail) => Ok(ToolOutput::ok(serde_json::to_string(detail)?)),
            None => {
                tracing::debug!(identifier = %args.character_url, "no character detail");
                Ok(ToolOutput::ok(NO_DETAIL_FOUND))
            }
        }
    }
}

/// Registry holding exactly the two unit tools.
pub fn unit_tool_registry(
    roster: Arc<Roster>,
    index: Arc<UnitIndex>,
    search_k: usize,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(FindRelevantUnitsTool::new(index, search_k)))?;
    registry.register(Box::new(GetCharacterDataTool::new(roster)))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use holocron_schema::{CharacterDetail, UnitListing};

    fn roster() -> Arc<Roster> {
        let listing = UnitListing {
            name: "Grand Master Yoda".into(),
            identifier: "https://swgoh.gg/units/grand-master-yoda/".into(),
            tags: vec!["Jedi".into()],
        };
        let detail = CharacterDetail {
            identifier: listing.identifier.clone(),
            base_stats: BTreeMap::from([("Speed".to_string(), "190".to_string())]),
            ability_classes: vec![],
            abilities: vec![],
            mods_data_url: "https://swgoh.gg/units/grand-master-yoda/best-mods/".into(),
            player_data_url: "https://swgoh.gg/units/grand-master-yoda/data/".into(),
        };
        Arc::new(Roster::from_parts(vec![listing], vec![detail]).unwrap())
    }

    #[test]
    fn hits_are_joined_in_rank_order() {
        let hits = vec![
            SearchHit {
                identifier: "u/a".into(),
                name: "A".into(),
                document: "Character: A".into(),
                score: 0.9,
            },
            SearchHit {
                identifier: "u/b".into(),
                name: "B".into(),
                document: "Character: B".into(),
                score: 0.5,
            },
        ];
        assert_eq!(
            format_hits(&hits),
            "Content: Character: A\nCharacter URL: u/a\n\n---\n\nContent: Character: B\nCharacter URL: u/b"
        );
        assert_eq!(format_hits(&[]), "");
    }

    #[tokio::test]
    async fn character_data_returns_full_record() {
        let tool = GetCharacterDataTool::new(roster());
        let output = tool
            .execute(serde_json::json!({
                "character_url": "https://swgoh.gg/units/grand-master-yoda/"
            }))
            .await
            .unwrap();
        assert!(!output.is_error);
        let value: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        assert_eq!(value["base_stats"]["Speed"], "190");
        assert_eq!(
            value["mods_data_url"],
            "https://swgoh.gg/units/grand-master-yoda/best-mods/"
        );
    }

    #[tokio::test]
    async fn character_data_accepts_identifier_alias() {
        let tool = GetCharacterDataTool::new(roster());
        let output = tool
            .execute(serde_json::json!({
                "identifier": "https://swgoh.gg/units/grand-master-yoda/"
            }))
            .await
            .unwrap();
        assert!(output.content.contains("best-mods"));
    }

    #[tokio::test]
    async fn unknown_identifier_yields_fixed_message() {
        let tool = GetCharacterDataTool::new(roster());
        let output = tool
            .execute(serde_json::json!({"character_url": "https://swgoh.gg/units/nobody/"}))
            .await
            .unwrap();
        assert_eq!(output.content, NO_DETAIL_FOUND);
        assert!(!output.is_error);
    }

    #[tokio::test]
    async fn missing_argument_is_an_error() {
        let tool = GetCharacterDataTool::new(roster());
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains(GET_CHARACTER_DATA));
    }
}
