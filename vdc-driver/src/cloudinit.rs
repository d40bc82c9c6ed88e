//! Cloud-init seed rendering.
//!
//! `user-data` is `#cloud-config` followed by the JSON serialization of the
//! validated document; JSON is a YAML subset, so cloud-init consumes it
//! as-is and no YAML dependency is needed. The two seed files are written to
//! the host and packed into an ISO9660 image labelled `cidata` (the NoCloud
//! datasource contract) by `genisoimage`.

use anyhow::Error;

use vdc_api_types::{CloudInitDocument, Ulid};

/// Render `user-data`. An absent document still produces a minimal valid
/// config so every guest gets its hostname set.
pub fn render_user_data(
    doc: Option<&CloudInitDocument>,
    vm_name: &str,
) -> Result<String, Error> {
    let mut doc = doc.cloned().unwrap_or_default();
    if doc.hostname.is_none() {
        doc.hostname = Some(vm_name.to_string());
    }
    let body = serde_json::to_string_pretty(&doc)?;
    Ok(format!("#cloud-config\n{body}\n"))
}

/// Render `meta-data` with a stable instance id, so a re-created seed ISO
/// does not re-trigger first-boot modules.
pub fn render_meta_data(vm_id: &Ulid, vm_name: &str) -> String {
    format!("instance-id: vdc-{vm_id}\nlocal-hostname: {vm_name}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdc_api_types::CloudInitUser;

    #[test]
    fn minimal_user_data() {
        let rendered = render_user_data(None, "web-1").unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains(r#""hostname": "web-1""#));
    }

    #[test]
    fn explicit_hostname_wins() {
        let doc = CloudInitDocument {
            hostname: Some("custom".to_string()),
            ..Default::default()
        };
        let rendered = render_user_data(Some(&doc), "web-1").unwrap();
        assert!(rendered.contains(r#""hostname": "custom""#));
        assert!(!rendered.contains("web-1"));
    }

    #[test]
    fn users_and_commands_round_trip() {
        let doc = CloudInitDocument {
            users: vec![CloudInitUser {
                name: "admin".to_string(),
                sudo: Some("ALL=(ALL) NOPASSWD:ALL".to_string()),
                shell: Some("/bin/bash".to_string()),
                ssh_authorized_keys: vec!["ssh-ed25519 AAAA...".to_string()],
            }],
            runcmd: vec!["systemctl enable nginx".to_string()],
            ..Default::default()
        };
        let rendered = render_user_data(Some(&doc), "web-1").unwrap();
        // the rendered body must stay parseable as the same document
        let body = rendered.strip_prefix("#cloud-config\n").unwrap();
        let parsed: CloudInitDocument = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.users[0].name, "admin");
        assert_eq!(parsed.runcmd, vec!["systemctl enable nginx".to_string()]);
    }

    #[test]
    fn meta_data_is_stable() {
        let id = Ulid::generate();
        assert_eq!(
            render_meta_data(&id, "web-1"),
            format!("instance-id: vdc-{id}\nlocal-hostname: web-1\n")
        );
    }
}
