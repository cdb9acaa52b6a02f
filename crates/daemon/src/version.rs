//! Build information

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub name: String,
    pub version: String,
    /// Comma separated list of enabled cargo features
    pub build_features: String,
    pub build_timestamp: String,
    pub build_profile: String,
}

impl BuildInfo {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.build_features
            .split(',')
            .any(|f| f.trim() == feature)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} build, features: {}, built {})",
            self.name, self.version, self.build_profile, self.build_features, self.build_timestamp
        )
    }
}

/// Build information for this binary
pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build_features: option_env!("BUILD_FEATURES").unwrap_or("none").to_string(),
        build_timestamp: option_env!("BUILD_TIMESTAMP")
            .unwrap_or("unknown")
            .to_string(),
        build_profile: option_env!("BUILD_PROFILE").unwrap_or("unknown").to_string(),
    }
}
