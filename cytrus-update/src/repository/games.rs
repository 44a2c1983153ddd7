//! Game list model (`cytrus.json`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One game as announced by the repository.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEntry {
    #[serde(default)]
    pub game_id: u64,

    /// Display ordering hint.
    #[serde(default)]
    pub order: i64,

    #[serde(default)]
    pub name: String,

    /// Presentation assets (opaque to the engine; forwarded to the host).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub assets: serde_json::Value,

    /// Platform to release channel to latest version.
    #[serde(default)]
    pub platforms: BTreeMap<String, BTreeMap<String, String>>,
}

impl GameEntry {
    /// Latest version for a release channel on a platform, if announced.
    pub fn version(&self, platform: &str, release: &str) -> Option<&str> {
        self.platforms
            .get(platform)
            .and_then(|channels| channels.get(release))
            .map(String::as_str)
    }

    /// Overlays `other` onto this entry.
    ///
    /// Scalar fields are replaced; the platform/channel maps are merged so a
    /// pre-release channel can appear next to the regular ones.
    fn merge(&mut self, other: &GameEntry) {
        self.game_id = other.game_id;
        self.order = other.order;
        if !other.name.is_empty() {
            self.name = other.name.clone();
        }
        if !other.assets.is_null() {
            self.assets = other.assets.clone();
        }
        for (platform, channels) in &other.platforms {
            let merged = self.platforms.entry(platform.clone()).or_default();
            for (release, version) in channels {
                merged.insert(release.clone(), version.clone());
            }
        }
    }
}

/// The `cytrus.json` document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamesList {
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub games: BTreeMap<String, GameEntry>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pre_released_games: BTreeMap<String, GameEntry>,
}

impl GamesList {
    /// The games visible to the host.
    ///
    /// With `pre_release` set, `preReleasedGames` is deep-merged into
    /// `games`; otherwise it is ignored.
    pub fn effective(&self, pre_release: bool) -> BTreeMap<String, GameEntry> {
        let mut games = self.games.clone();
        if pre_release {
            for (uid, entry) in &self.pre_released_games {
                match games.get_mut(uid) {
                    Some(existing) => existing.merge(entry),
                    None => {
                        games.insert(uid.clone(), entry.clone());
                    }
                }
            }
        }
        games
    }
}
