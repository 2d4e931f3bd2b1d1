//! Remote update descriptor.
//!
//! ```json
//! { "latest": { "versionName": "1.2", "versionCode": 12, "changelog": "...",
//!               "forceUpdate": false, "downloadPage": "...", "apkUrl": "..." } }
//! ```
//!
//! Fetching the descriptor is up to the embedding application. Missing
//! fields take their defaults; a descriptor whose `versionCode` is not
//! positive is rejected.

use serde::{Deserialize, Serialize};

use crate::error::VdError;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateInfo {
    pub version_name: String,
    pub version_code: i32,
    pub changelog: String,
    pub force_update: bool,
    pub download_page: String,
    pub apk_url: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    latest: Option<UpdateInfo>,
}

impl UpdateInfo {
    pub fn parse(json: &str) -> Result<Self, VdError> {
        let descriptor: Descriptor = serde_json::from_str(json)?;
        let info = descriptor
            .latest
            .ok_or_else(|| VdError::InvalidConfig("update descriptor has no `latest` entry".into()))?;
        if info.version_code <= 0 {
            return Err(VdError::InvalidConfig(format!(
                "update versionCode {} is not positive",
                info.version_code
            )));
        }
        Ok(info)
    }

    /// Whether `current_code` is older. An unknown current version
    /// (`<= 0`) never asks for an update.
    pub fn is_update_needed(&self, current_code: i32) -> bool {
        current_code > 0 && current_code < self.version_code
    }

    /// Prompt at most once per published version.
    pub fn should_prompt(&self, last_prompted_code: i32) -> bool {
        self.version_code > 0 && self.version_code > last_prompted_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "latest": {
            "versionName": "1.4.0",
            "versionCode": 14,
            "changelog": "fixes",
            "forceUpdate": true,
            "downloadPage": "https://example.invalid/dl",
            "apkUrl": "https://example.invalid/app.apk"
        }
    }"#;

    #[test]
    fn parses_full_descriptor() {
        let info = UpdateInfo::parse(DESCRIPTOR).unwrap();
        assert_eq!(info.version_name, "1.4.0");
        assert_eq!(info.version_code, 14);
        assert!(info.force_update);
    }

    #[test]
    fn missing_fields_default() {
        let info = UpdateInfo::parse(r#"{"latest":{"versionCode":3}}"#).unwrap();
        assert_eq!(info.version_name, "");
        assert!(!info.force_update);
    }

    #[test]
    fn rejects_non_positive_code_and_garbage() {
        assert!(UpdateInfo::parse(r#"{"latest":{"versionCode":0}}"#).is_err());
        assert!(UpdateInfo::parse(r#"{"latest":{}}"#).is_err());
        assert!(UpdateInfo::parse(r#"{}"#).is_err());
        assert!(matches!(UpdateInfo::parse("<html>"), Err(VdError::Json(_))));
    }

    #[test]
    fn update_and_prompt_decisions() {
        let info = UpdateInfo::parse(DESCRIPTOR).unwrap();
        assert!(info.is_update_needed(13));
        assert!(!info.is_update_needed(14));
        assert!(!info.is_update_needed(0));

        assert!(info.should_prompt(0));
        assert!(info.should_prompt(13));
        assert!(!info.should_prompt(14));
    }
}
