//! The persisted per-release state record.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current schema of `release.json`.
pub const SCHEMA_VERSION: u32 = 2;

/// Legacy display-name to game uid mapping.
///
/// Records written before the uid era carry `gameName`; anything not in the
/// table folds to lowercase.
const GAME_NAME_TO_UID: &[(&str, &str)] = &[
    ("Dofus", "dofus"),
    ("Wakfu", "wakfu"),
    ("Krosmaga", "krosmaga"),
    ("Waven", "waven"),
    ("Dofus Retro", "retro"),
];

/// Everything the engine remembers about one release between sessions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseState {
    #[serde(default)]
    pub schema_version: u32,

    pub game_uid: String,
    pub release_name: String,

    /// Install location; unset means not installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,

    /// Installed version; set only after a run fully landed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Latest version the repository announced for this release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_version: Option<String>,

    #[serde(default)]
    pub installed_fragments: Vec<String>,

    #[serde(default)]
    pub is_installing: bool,

    #[serde(default)]
    pub is_updating: bool,

    /// Repository version at the time the repair started; `None` when no
    /// repair is in flight. (Legacy records stored a boolean here.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_repairing: Option<String>,

    #[serde(default)]
    pub is_moving: bool,

    /// Bytes downloaded by an interrupted update, for progress carry-over.
    #[serde(default)]
    pub update_downloaded_size: u64,

    /// When `update_downloaded_size` was recorded (ms since the epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_downloaded_size_date: Option<u64>,

    #[serde(default)]
    pub update_paused_by_user: bool,

    /// The local manifest may not reflect disk; repair before anything else.
    #[serde(default)]
    pub is_dirty: bool,
}

impl ReleaseState {
    pub fn new(game_uid: impl Into<String>, release_name: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            game_uid: game_uid.into(),
            release_name: release_name.into(),
            ..Self::default()
        }
    }

    /// Clears the install location and everything that only makes sense
    /// with one.
    pub fn clear_location(&mut self) {
        self.location = None;
        self.version = None;
        self.installed_fragments.clear();
        self.is_installing = false;
        self.is_updating = false;
        self.is_repairing = None;
        self.is_moving = false;
        self.update_downloaded_size = 0;
        self.update_downloaded_size_date = None;
        self.update_paused_by_user = false;
    }

    /// Clears the in-flight run flags (after a run settles either way).
    pub fn clear_run_flags(&mut self) {
        self.is_installing = false;
        self.is_updating = false;
        self.is_repairing = None;
    }

    /// True if any run was in flight when the record was last written.
    pub fn has_run_in_flight(&self) -> bool {
        self.is_installing || self.is_updating || self.is_repairing.is_some()
    }
}

/// Migrates a raw `release.json` document to the current schema.
///
/// - `gameName` becomes `gameUid` through the translation table
/// - a boolean `isRepairing` becomes the repository-version string
pub fn migrate(mut value: serde_json::Value) -> serde_json::Value {
    let Some(map) = value.as_object_mut() else {
        return value;
    };

    if !map.contains_key("gameUid") {
        if let Some(name) = map.remove("gameName").and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        }) {
            let uid = GAME_NAME_TO_UID
                .iter()
                .find(|(legacy, _)| *legacy == name)
                .map(|(_, uid)| (*uid).to_string())
                .unwrap_or_else(|| name.to_lowercase());
            map.insert("gameUid".to_string(), serde_json::Value::String(uid));
        }
    }

    match map.get("isRepairing") {
        Some(serde_json::Value::Bool(true)) => {
            let version = map
                .get("repositoryVersion")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            map.insert(
                "isRepairing".to_string(),
                serde_json::Value::String(version),
            );
        }
        Some(serde_json::Value::Bool(false)) => {
            map.remove("isRepairing");
        }
        _ => {}
    }

    map.insert(
        "schemaVersion".to_string(),
        serde_json::Value::from(SCHEMA_VERSION),
    );
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clear_location_resets_dependent_state() {
        let mut state = ReleaseState::new("dofus", "main");
        state.location = Some(PathBuf::from("/games/dofus"));
        state.version = Some("5.0_1".to_string());
        state.installed_fragments = vec!["main".to_string()];
        state.is_updating = true;
        state.update_downloaded_size = 1234;

        state.clear_location();

        assert!(state.location.is_none());
        assert!(state.version.is_none());
        assert!(state.installed_fragments.is_empty());
        assert!(!state.is_updating);
        assert_eq!(state.update_downloaded_size, 0);
    }

    #[test]
    fn test_migrate_game_name_known() {
        let migrated = migrate(json!({ "gameName": "Dofus Retro", "releaseName": "main" }));
        assert_eq!(migrated["gameUid"], "retro");
        assert!(migrated.get("gameName").is_none());
        assert_eq!(migrated["schemaVersion"], SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_game_name_unknown_folds_lowercase() {
        let migrated = migrate(json!({ "gameName": "SomeGame", "releaseName": "main" }));
        assert_eq!(migrated["gameUid"], "somegame");
    }

    #[test]
    fn test_migrate_keeps_existing_uid() {
        let migrated = migrate(json!({ "gameUid": "dofus", "gameName": "Dofus" }));
        assert_eq!(migrated["gameUid"], "dofus");
    }

    #[test]
    fn test_migrate_boolean_is_repairing() {
        let migrated = migrate(json!({
            "gameUid": "dofus",
            "releaseName": "main",
            "isRepairing": true,
            "repositoryVersion": "5.0_2"
        }));
        assert_eq!(migrated["isRepairing"], "5.0_2");

        let migrated = migrate(json!({
            "gameUid": "dofus",
            "releaseName": "main",
            "isRepairing": false
        }));
        assert!(migrated.get("isRepairing").is_none());

        // Already-migrated string values pass through.
        let migrated = migrate(json!({
            "gameUid": "dofus",
            "releaseName": "main",
            "isRepairing": "5.0_3"
        }));
        assert_eq!(migrated["isRepairing"], "5.0_3");
    }

    #[test]
    fn test_migrated_record_deserializes() {
        let migrated = migrate(json!({
            "gameName": "Dofus",
            "releaseName": "main",
            "isRepairing": true,
            "repositoryVersion": "5.0_2",
            "location": "/games/dofus"
        }));
        let state: ReleaseState = serde_json::from_value(migrated).unwrap();
        assert_eq!(state.game_uid, "dofus");
        assert_eq!(state.is_repairing.as_deref(), Some("5.0_2"));
        assert_eq!(state.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_state_round_trip() {
        let mut state = ReleaseState::new("wakfu", "beta");
        state.location = Some(PathBuf::from("/games/wakfu"));
        state.installed_fragments = vec!["main".to_string(), "en".to_string()];
        state.is_dirty = true;

        let json = serde_json::to_value(&state).unwrap();
        let back: ReleaseState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
