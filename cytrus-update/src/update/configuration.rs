//! Release configuration.
//!
//! The configuration fragment ships a JSON file describing the release's
//! fragments, an optional machine-compatibility check, and presentation
//! details the engine forwards to the host. It is downloaded first on every
//! run: the rest of the plan depends on what it says.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::CONFIGURATION_FRAGMENT;

/// File the configuration fragment drops at the install location root.
pub const CONFIGURATION_FILE: &str = "zaap.config.json";

/// One fragment the release offers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentRule {
    pub name: String,

    /// Optional fragments are user-selectable; the rest always install.
    #[serde(default)]
    pub optional: bool,

    /// Whether an optional fragment is selected when the user never chose.
    #[serde(default)]
    pub default: bool,
}

/// The machine-compatibility check of a release.
///
/// The command runs from the install location; its exit code is looked up
/// in `results` and a hit fails the update with that message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationCheck {
    /// Install-relative path of the validator.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Exit code (as decimal string) to error message.
    #[serde(default)]
    pub results: BTreeMap<String, String>,
}

/// Parsed contents of [`CONFIGURATION_FILE`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfiguration {
    #[serde(default)]
    pub fragments: Vec<FragmentRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<ConfigurationCheck>,

    /// Install-relative folder holding license files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenses_folder: Option<String>,
}

impl ReleaseConfiguration {
    /// Reads the configuration file from an install location.
    ///
    /// Absent file means the release carries no configuration beyond the
    /// fragment itself; callers keep their current selection.
    pub async fn read(location: &Path) -> UpdateResult<Option<Self>> {
        let path = location.join(CONFIGURATION_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UpdateError::io(path, e)),
        };
        let configuration = serde_json::from_slice(&raw)
            .map_err(|e| UpdateError::json(CONFIGURATION_FILE, e))?;
        Ok(Some(configuration))
    }

    /// Computes the fragment selection given what the user selected before.
    ///
    /// Mandatory fragments always install. Optional fragments keep the
    /// user's previous choice when they made one, and fall back to the
    /// rule's default otherwise. The configuration fragment itself is never
    /// part of the content selection.
    pub fn select_fragments(&self, previous: &[String]) -> Vec<String> {
        let previously_known: Vec<&str> = self
            .fragments
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        let user_chose = previous
            .iter()
            .any(|name| previously_known.contains(&name.as_str()));

        self.fragments
            .iter()
            .filter(|rule| rule.name != CONFIGURATION_FRAGMENT)
            .filter(|rule| {
                if !rule.optional {
                    return true;
                }
                if user_chose {
                    previous.iter().any(|name| name == &rule.name)
                } else {
                    rule.default
                }
            })
            .map(|rule| rule.name.clone())
            .collect()
    }
}
