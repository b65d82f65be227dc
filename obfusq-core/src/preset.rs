//! Obfuscation presets
//!
//! A preset is a named bundle of settings understood by the external
//! obfuscator. HTTP clients may only pick from the fixed [`Preset`] set;
//! operators can additionally point the tool at a config file.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Presets accepted by the obfuscator's `--preset` flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preset {
    Minify,
    RobloxLight,
    #[default]
    RobloxMedium,
    RobloxStrong,
}

impl Preset {
    /// Every preset, weakest first
    pub const ALL: [Preset; 4] = [
        Preset::Minify,
        Preset::RobloxLight,
        Preset::RobloxMedium,
        Preset::RobloxStrong,
    ];

    /// Name as passed on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Minify => "Minify",
            Preset::RobloxLight => "RobloxLight",
            Preset::RobloxMedium => "RobloxMedium",
            Preset::RobloxStrong => "RobloxStrong",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a preset name outside the whitelist
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown preset: {0:?}")]
pub struct UnknownPreset(pub String);

impl FromStr for Preset {
    type Err = UnknownPreset;

    // Exact, case-sensitive match: the tool itself is case-sensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}

/// How the obfuscator should be configured for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresetSelection {
    /// `--preset <name>`
    Named(Preset),
    /// `--config <path>`
    ConfigFile(PathBuf),
}

impl PresetSelection {
    /// Arguments selecting this configuration
    pub fn to_args(&self) -> Vec<OsString> {
        match self {
            PresetSelection::Named(preset) => vec!["--preset".into(), preset.as_str().into()],
            PresetSelection::ConfigFile(path) => vec!["--config".into(), path.clone().into()],
        }
    }
}

impl Default for PresetSelection {
    fn default() -> Self {
        PresetSelection::Named(Preset::default())
    }
}

impl From<Preset> for PresetSelection {
    fn from(preset: Preset) -> Self {
        PresetSelection::Named(preset)
    }
}

impl fmt::Display for PresetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresetSelection::Named(preset) => write!(f, "preset {}", preset),
            PresetSelection::ConfigFile(path) => write!(f, "config {}", path.display()),
        }
    }
}
