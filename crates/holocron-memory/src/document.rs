//! Retrieval document rendering.

use holocron_schema::{AbilityRecord, CharacterDetail, CharacterSummary, UnitListing};

/// `"<name> (<type>)[ <marker>]: <summary>"`
pub fn ability_line(ability: &AbilityRecord, summary: &str) -> String {
    match ability.elite_marker() {
        Some(marker) => format!(
            "{} ({}) {}: {}",
            ability.name, ability.ability_type, marker, summary
        ),
        None => format!("{} ({}): {}", ability.name, ability.ability_type, summary),
    }
}

/// Render the searchable document for one character.
///
/// `summaries` is aligned with `detail.rendered_abilities()`: one text per
/// non-placeholder ability, in order.
pub fn render_document(
    listing: &UnitListing,
    detail: &CharacterDetail,
    summaries: &[String],
) -> String {
    let mut lines = vec![
        format!("Character: {}", listing.name),
        format!("Tags: {}", listing.tags.join(", ")),
    ];
    if !detail.ability_classes.is_empty() {
        lines.push(format!(
            "Ability Classes: {}",
            detail.ability_classes.join(", ")
        ));
    }

    let abilities: Vec<String> = detail
        .rendered_abilities()
        .zip(summaries)
        .map(|(ability, summary)| ability_line(ability, summary))
        .collect();
    if !abilities.is_empty() {
        lines.push("Abilities:".to_string());
        lines.extend(abilities);
    }

    lines.join("\n")
}

pub fn summarize_unit(
    listing: &UnitListing,
    detail: &CharacterDetail,
    summaries: &[String],
) -> CharacterSummary {
    CharacterSummary {
        identifier: listing.identifier.clone(),
        name: listing.name.clone(),
        tags: listing.tags.clone(),
        document: render_document(listing, detail, summaries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holocron_schema::{AbilityType, PLACEHOLDER_DESCRIPTION};
    use std::collections::BTreeMap;

    fn ability(name: &str, zeta: bool, omicron: bool, ultimate: bool) -> AbilityRecord {
        AbilityRecord {
            name: name.into(),
            ability_type: AbilityType::Leader,
            description: format!("{name} description"),
            breakdown_link: None,
            is_zeta: zeta,
            is_omicron: omicron,
            is_ultimate: ultimate,
        }
    }

    #[test]
    fn zeta_suppresses_ultimate_marker() {
        let line = ability_line(&ability("Vaapad", true, false, true), "Gains Offense.");
        assert_eq!(line, "Vaapad (Leader) [Zeta]: Gains Offense.");
    }

    #[test]
    fn no_flags_renders_no_bracket() {
        let line = ability_line(&ability("Strike", false, false, false), "Deals damage.");
        assert_eq!(line, "Strike (Leader): Deals damage.");
        assert!(!line.contains('['));
    }

    #[test]
    fn zeta_and_omicron_render_together() {
        let line = ability_line(&ability("Mastery", true, true, false), "x");
        assert_eq!(line, "Mastery (Leader) [Zeta,Omicron]: x");
    }

    #[test]
    fn placeholder_ability_is_excluded_from_document() {
        let mut hidden = ability("Hidden", true, false, false);
        hidden.description = PLACEHOLDER_DESCRIPTION.into();
        let listing = UnitListing {
            name: "Jedi Master Mace Windu".into(),
            identifier: "u/jmmw".into(),
            tags: vec!["Galactic Republic".into(), "Jedi".into()],
        };
        let detail = CharacterDetail {
            identifier: "u/jmmw".into(),
            base_stats: BTreeMap::new(),
            ability_classes: vec!["Dispel".into()],
            abilities: vec![hidden, ability("Vaapad", false, false, false)],
            mods_data_url: String::new(),
            player_data_url: String::new(),
        };

        let doc = render_document(&listing, &detail, &["Short summary.".to_string()]);
        assert!(!doc.contains("Hidden"));
        assert!(doc.contains("Vaapad (Leader): Short summary."));
        assert!(doc.starts_with("Character: Jedi Master Mace Windu\nTags: Galactic Republic, Jedi"));
        assert!(doc.contains("Ability Classes: Dispel"));
    }
}
