//! Preparation profiles: named sets of winetricks components

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Readiness level of a prefix
///
/// Each profile's component list is a superset of the one below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Profile {
    #[serde(rename = "minimal")]
    Minimal,
    #[default]
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "full")]
    Full,
}

const MINIMAL: &[&str] = &["win11", "corefonts", "tahoma", "crypt32", "d3dcompiler_47"];

const STANDARD: &[&str] = &[
    "win11",
    "corefonts",
    "tahoma",
    "crypt32",
    "d3dcompiler_47",
    "vcrun2022",
];

const FULL: &[&str] = &[
    "win11",
    "corefonts",
    "tahoma",
    "crypt32",
    "d3dcompiler_47",
    "vcrun2022",
    "dotnet48",
    "dxvk",
    "vkd3d",
    "remove_mono",
];

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Minimal, Profile::Standard, Profile::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Minimal => "minimal",
            Profile::Standard => "standard",
            Profile::Full => "full",
        }
    }

    /// Ordered component identifiers for this profile
    pub fn components(&self) -> &'static [&'static str] {
        match self {
            Profile::Minimal => MINIMAL,
            Profile::Standard => STANDARD,
            Profile::Full => FULL,
        }
    }

    /// Components of `self` not covered by `previous`, in `self`'s order
    pub fn missing_since(&self, previous: Option<Profile>) -> Vec<&'static str> {
        let applied = previous.map(|p| p.components()).unwrap_or(&[]);
        self.components()
            .iter()
            .copied()
            .filter(|component| !applied.contains(component))
            .collect()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(Profile::Minimal),
            "standard" => Ok(Profile::Standard),
            "full" => Ok(Profile::Full),
            other => Err(format!(
                "Unknown profile: {} (valid options: minimal, standard, full)",
                other
            )),
        }
    }
}
