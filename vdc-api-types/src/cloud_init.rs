//! The recognized cloud-init option set.
//!
//! The schema is fixed and validated at the API boundary; unknown keys are
//! rejected (`deny_unknown_fields`) rather than silently ignored. The
//! document serializes directly to the `#cloud-config` key layout, so the
//! driver can render `user-data` from it without a separate template.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api_bail;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInitDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<CloudInitUser>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    /// Ordered commands run once at first boot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<CloudInitWriteFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apt: Option<CloudInitApt>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInitUser {
    pub name: String,
    /// A sudoers rule, e.g. `ALL=(ALL) NOPASSWD:ALL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInitWriteFile {
    pub path: String,
    pub content: String,
    /// Octal mode string, e.g. `0644`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// `user:group`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInitApt {
    pub sources: BTreeMap<String, AptSource>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AptSource {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
}

impl CloudInitDocument {
    /// Validate the parts serde cannot: paths must be absolute, names and
    /// modes well-formed.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for user in &self.users {
            if user.name.is_empty() {
                api_bail!(Validation, "cloud-init user with empty name");
            }
        }
        for file in &self.write_files {
            if !file.path.starts_with('/') {
                api_bail!(
                    Validation,
                    "cloud-init write_files path '{}' is not absolute",
                    file.path
                );
            }
            if let Some(permissions) = &file.permissions {
                if permissions.is_empty()
                    || !permissions.chars().all(|c| ('0'..='7').contains(&c))
                {
                    api_bail!(
                        Validation,
                        "cloud-init write_files permissions '{permissions}' is not an octal mode"
                    );
                }
            }
        }
        if let Some(apt) = &self.apt {
            for (name, source) in &apt.sources {
                if name.is_empty() || source.source.is_empty() {
                    api_bail!(Validation, "cloud-init apt source '{name}' is incomplete");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_rejected() {
        let doc = serde_json::json!({ "hostname": "vm1", "bootcmd": ["rm -rf /"] });
        assert!(serde_json::from_value::<CloudInitDocument>(doc).is_err());
    }

    #[test]
    fn validation() {
        let mut doc = CloudInitDocument {
            hostname: Some("vm1".into()),
            write_files: vec![CloudInitWriteFile {
                path: "/etc/motd".into(),
                content: "hello".into(),
                permissions: Some("0644".into()),
                owner: None,
            }],
            ..Default::default()
        };
        doc.validate().unwrap();

        doc.write_files[0].path = "etc/motd".into();
        doc.validate().unwrap_err();

        doc.write_files[0].path = "/etc/motd".into();
        doc.write_files[0].permissions = Some("rw-r--r--".into());
        doc.validate().unwrap_err();
    }
}
