//! SSH provisioning for repository clones.
//!
//! A Waybill may reference a Secret holding one or more SSH keys. Each
//! `key_<name>` entry is materialized under the per-run home and bound to a
//! synthesized `Host <name>_github_com` alias in an ssh config, so that
//! remotes in the tree can select a specific key. Remote addresses inside
//! kustomization files are rewritten to those aliases when they carry the
//! key marker comment.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::Secret;
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use super::policy::check_secret_is_allowed;
use crate::client::ClusterClient;
use crate::crd::Waybill;
use crate::Error;

const KUSTOMIZATION_FILE_NAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

const INSECURE_KNOWN_HOSTS_FRAGMENT: &str =
    "-o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

fn key_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#\skube-applier:\skey_(\w+)").expect("valid regex"))
}

fn repo_address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?P<prefix>^\s*-\s*ssh://)(?P<user>\w.+?@)?(?P<domain>github\.com)(?P<repo>[/:].*$)")
            .expect("valid regex")
    })
}

/// Write the SSH configuration for a run into `<home>/.ssh` and return the
/// `GIT_SSH_COMMAND` environment entry for the apply pipeline.
///
/// Without a key secret, the process-wide default key is used when
/// configured; otherwise the identity file points at /dev/null so that any
/// SSH remote in the tree fails loudly instead of picking up ambient keys.
pub async fn setup_git_ssh(
    cluster: &dyn ClusterClient,
    waybill: &Waybill,
    home_dir: &Path,
    default_key_path: Option<&Path>,
) -> Result<(String, String), Error> {
    let ssh_dir = home_dir.join(".ssh");
    std::fs::create_dir_all(&ssh_dir)?;
    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;

    let Some(secret_ref) = waybill.spec.git_ssh_secret_ref.as_ref() else {
        if let Some(default) = default_key_path {
            debug!(
                waybill = %waybill.id(),
                path = %default.display(),
                "no gitSSHSecretRef set, falling back to the default ssh key"
            );
            return Ok((
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -q -F none -o IdentitiesOnly=yes -o User=git -o IdentityFile={} {}",
                    default.display(),
                    INSECURE_KNOWN_HOSTS_FRAGMENT
                ),
            ));
        }
        debug!(waybill = %waybill.id(), "no git ssh key found, pointing the identity file to /dev/null");
        return Ok((
            "GIT_SSH_COMMAND".to_string(),
            format!(
                "ssh -q -F none -o IdentitiesOnly=yes -o IdentityFile=/dev/null {}",
                INSECURE_KNOWN_HOSTS_FRAGMENT
            ),
        ));
    };

    let secret_namespace = secret_ref
        .namespace
        .as_deref()
        .unwrap_or_else(|| waybill.namespace());
    let secret = cluster.get_secret(secret_namespace, &secret_ref.name).await?;
    check_secret_is_allowed(waybill, &secret)?;

    let config_path = ssh_dir.join("config");
    let body = construct_ssh_config(&secret, &ssh_dir)?;
    write_file(&config_path, body.as_bytes(), 0o644)?;

    let mut known_hosts_fragment = INSECURE_KNOWN_HOSTS_FRAGMENT.to_string();
    if let Some(known_hosts) = secret.data.as_ref().and_then(|d| d.get("known_hosts")) {
        let known_hosts_path = ssh_dir.join("known_hosts");
        write_file(&known_hosts_path, &known_hosts.0, 0o600)?;
        known_hosts_fragment = format!("-o UserKnownHostsFile={}", known_hosts_path.display());
    }

    Ok((
        "GIT_SSH_COMMAND".to_string(),
        format!(
            "ssh -q -F {} {}",
            config_path.display(),
            known_hosts_fragment
        ),
    ))
}

/// Write each `key_` entry of the secret into the ssh directory and compose
/// the config body binding every key to its host alias
fn construct_ssh_config(secret: &Secret, ssh_dir: &Path) -> Result<String, Error> {
    let secret_id = format!(
        "{}/{}",
        secret.metadata.namespace.as_deref().unwrap_or_default(),
        secret.metadata.name.as_deref().unwrap_or_default()
    );
    let mut host_fragments = Vec::new();
    let mut single_key_file: Option<PathBuf> = None;
    let mut key_count = 0;

    if let Some(data) = secret.data.as_ref() {
        for (entry, value) in data {
            let Some(name) = entry.strip_prefix("key_") else {
                continue;
            };
            key_count += 1;
            // ssh silently ignores a key file without a trailing newline
            let mut material = value.0.clone();
            if !material.ends_with(b"\n") {
                material.push(b'\n');
            }
            let key_path = ssh_dir.join(entry);
            write_file(&key_path, &material, 0o600)?;
            host_fragments.push(host_fragment(name, &key_path));
            single_key_file = Some(key_path);
        }
    }

    if host_fragments.is_empty() {
        return Err(Error::secret(format!(
            r#"secret "{}" does not contain any keys"#,
            secret_id
        )));
    }
    if key_count == 1 {
        // A single key also serves plain github.com remotes
        let key_path = single_key_file.expect("a key was written");
        host_fragments.push(format!(
            "Host github.com\n    HostName github.com\n    IdentitiesOnly yes\n    IdentityFile {}\n    User git\n",
            key_path.display()
        ));
    }
    Ok(host_fragments.join("\n"))
}

fn host_fragment(name: &str, key_path: &Path) -> String {
    format!(
        "Host {}_github_com\n    HostName github.com\n    IdentitiesOnly yes\n    IdentityFile {}\n    User git\n",
        name,
        key_path.display()
    )
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Rewrite SSH remote addresses in kustomization files to the per-key host
/// aliases.
///
/// A remote is rewritten when the preceding line carries the marker
/// `# kube-applier: key_<name>`; the github.com host is then replaced with
/// `<name>_github_com`, which resolves through the config written by
/// [`setup_git_ssh`]. Dots cannot appear in the alias as they would break
/// Host matching in ssh config.
pub fn update_repo_base_addresses(repo_dir: &Path) -> Result<(), Error> {
    let mut kustomization_files = Vec::new();
    for entry in WalkDir::new(repo_dir).into_iter().filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().is_file() && KUSTOMIZATION_FILE_NAMES.contains(&name.as_str()) {
            kustomization_files.push(entry.into_path());
        }
    }

    for file in kustomization_files {
        let contents = std::fs::read_to_string(&file)?;
        let mut out = String::with_capacity(contents.len());
        let mut key_name: Option<String> = None;
        for line in contents.lines() {
            let rewritten = match key_name.take() {
                Some(key) => rewrite_remote_line(line, &key),
                None => {
                    if let Some(caps) = key_name_pattern().captures(line) {
                        key_name = Some(caps[1].to_string());
                    }
                    line.to_string()
                }
            };
            out.push_str(&rewritten);
            out.push('\n');
        }
        std::fs::write(&file, out)?;
    }
    Ok(())
}

/// Replace the host of an SSH remote with the keyed alias, preserving the
/// list prefix, the user and the repository details
fn rewrite_remote_line(line: &str, key: &str) -> String {
    let Some(caps) = repo_address_pattern().captures(line) else {
        return line.to_string();
    };
    let sanitized_domain = caps["domain"].replace('.', "_");
    format!(
        "{}{}{}_{}{}",
        &caps["prefix"],
        caps.name("user").map(|m| m.as_str()).unwrap_or_default(),
        key,
        sanitized_domain,
        &caps["repo"]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::crd::{ObjectReference, WaybillSpec};
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn waybill(namespace: &str) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: WaybillSpec::default(),
            status: None,
        }
    }

    fn ssh_secret(namespace: &str, entries: &[(&str, &[u8])]) -> Secret {
        let mut data = BTreeMap::new();
        for (k, v) in entries {
            data.insert(k.to_string(), ByteString(v.to_vec()));
        }
        Secret {
            metadata: ObjectMeta {
                name: Some("ssh-keys".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    fn file_mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn without_a_secret_the_default_key_is_used() {
        let home = tempfile::tempdir().unwrap();
        let cluster = MockClusterClient::new();
        let (key, value) = setup_git_ssh(
            &cluster,
            &waybill("app-a"),
            home.path(),
            Some(Path::new("/etc/ssh-key/id_rsa")),
        )
        .await
        .unwrap();
        assert_eq!(key, "GIT_SSH_COMMAND");
        assert!(value.contains("-o IdentityFile=/etc/ssh-key/id_rsa"));
        assert!(value.contains("-o User=git"));
        assert!(value.contains("StrictHostKeyChecking=no"));
        assert!(home.path().join(".ssh").is_dir());
    }

    #[tokio::test]
    async fn without_any_key_the_identity_file_is_dev_null() {
        let home = tempfile::tempdir().unwrap();
        let cluster = MockClusterClient::new();
        let (_, value) = setup_git_ssh(&cluster, &waybill("app-a"), home.path(), None)
            .await
            .unwrap();
        assert!(value.contains("-o IdentityFile=/dev/null"));
    }

    #[tokio::test]
    async fn keys_are_materialized_with_host_aliases() {
        let home = tempfile::tempdir().unwrap();
        let mut wb = waybill("app-a");
        wb.spec.git_ssh_secret_ref = Some(ObjectReference {
            name: "ssh-keys".to_string(),
            namespace: None,
        });

        let mut cluster = MockClusterClient::new();
        cluster.expect_get_secret().returning(|ns, _| {
            Ok(ssh_secret(
                ns,
                &[
                    ("key_deploy", b"KEY MATERIAL".as_slice()),
                    ("key_other", b"OTHER KEY\n".as_slice()),
                ],
            ))
        });

        let (_, value) = setup_git_ssh(&cluster, &wb, home.path(), None).await.unwrap();
        let ssh_dir = home.path().join(".ssh");
        assert!(value.contains(&format!("-F {}", ssh_dir.join("config").display())));
        assert!(value.contains("UserKnownHostsFile=/dev/null"));

        let config = std::fs::read_to_string(ssh_dir.join("config")).unwrap();
        assert!(config.contains("Host deploy_github_com"));
        assert!(config.contains("Host other_github_com"));
        // Two keys: no fallback stanza for bare github.com
        assert!(!config.contains("Host github.com\n"));

        // Key material is written 0600 with a guaranteed trailing newline
        let deploy = ssh_dir.join("key_deploy");
        assert_eq!(file_mode(&deploy), 0o600);
        assert_eq!(std::fs::read(&deploy).unwrap(), b"KEY MATERIAL\n");

        // Every identity file lies under the per-run home
        for line in config.lines().filter(|l| l.contains("IdentityFile")) {
            let path = line.trim().trim_start_matches("IdentityFile ").trim();
            assert!(path.starts_with(&home.path().to_string_lossy().into_owned()));
        }
    }

    #[tokio::test]
    async fn a_single_key_also_serves_plain_github_remotes() {
        let home = tempfile::tempdir().unwrap();
        let mut wb = waybill("app-a");
        wb.spec.git_ssh_secret_ref = Some(ObjectReference {
            name: "ssh-keys".to_string(),
            namespace: None,
        });

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_secret()
            .returning(|ns, _| Ok(ssh_secret(ns, &[("key_deploy", b"KEY\n".as_slice())])));

        setup_git_ssh(&cluster, &wb, home.path(), None).await.unwrap();
        let config = std::fs::read_to_string(home.path().join(".ssh/config")).unwrap();
        assert!(config.contains("Host deploy_github_com"));
        assert!(config.contains("Host github.com\n"));
    }

    #[tokio::test]
    async fn known_hosts_entries_replace_the_insecure_fallback() {
        let home = tempfile::tempdir().unwrap();
        let mut wb = waybill("app-a");
        wb.spec.git_ssh_secret_ref = Some(ObjectReference {
            name: "ssh-keys".to_string(),
            namespace: None,
        });

        let mut cluster = MockClusterClient::new();
        cluster.expect_get_secret().returning(|ns, _| {
            Ok(ssh_secret(
                ns,
                &[
                    ("key_deploy", b"KEY\n".as_slice()),
                    ("known_hosts", b"github.com ssh-ed25519 AAAA\n".as_slice()),
                ],
            ))
        });

        let (_, value) = setup_git_ssh(&cluster, &wb, home.path(), None).await.unwrap();
        let known_hosts = home.path().join(".ssh/known_hosts");
        assert!(value.contains(&format!("-o UserKnownHostsFile={}", known_hosts.display())));
        assert!(!value.contains("StrictHostKeyChecking=no"));
        assert_eq!(file_mode(&known_hosts), 0o600);
    }

    #[tokio::test]
    async fn a_secret_without_keys_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let mut wb = waybill("app-a");
        wb.spec.git_ssh_secret_ref = Some(ObjectReference {
            name: "ssh-keys".to_string(),
            namespace: None,
        });

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_secret()
            .returning(|ns, _| Ok(ssh_secret(ns, &[("not_a_key", b"data".as_slice())])));

        let err = setup_git_ssh(&cluster, &wb, home.path(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not contain any keys"));
    }

    #[test]
    fn keyed_remotes_are_rewritten_to_host_aliases() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(
            repo.path().join("kustomization.yaml"),
            "resources:\n\
             # kube-applier: key_deploy\n\
             - ssh://git@github.com/org/base?ref=main\n\
             - ssh://git@github.com/org/unkeyed?ref=main\n",
        )
        .unwrap();

        update_repo_base_addresses(repo.path()).unwrap();

        let rewritten = std::fs::read_to_string(repo.path().join("kustomization.yaml")).unwrap();
        assert!(rewritten.contains("- ssh://git@deploy_github_com/org/base?ref=main"));
        // Only the line following the marker is rewritten
        assert!(rewritten.contains("- ssh://git@github.com/org/unkeyed?ref=main"));
    }

    #[test]
    fn rewrite_walks_nested_kustomizations_and_spellings() {
        let repo = tempfile::tempdir().unwrap();
        let nested = repo.path().join("overlays/prod");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("Kustomization"),
            "# kube-applier: key_prod\n- ssh://github.com/org/prod-base\n",
        )
        .unwrap();
        std::fs::write(repo.path().join("deployment.yaml"), "kind: Deployment\n").unwrap();

        update_repo_base_addresses(repo.path()).unwrap();

        let rewritten = std::fs::read_to_string(nested.join("Kustomization")).unwrap();
        assert!(rewritten.contains("- ssh://prod_github_com/org/prod-base"));
        // Non-kustomization files are untouched
        let untouched = std::fs::read_to_string(repo.path().join("deployment.yaml")).unwrap();
        assert_eq!(untouched, "kind: Deployment\n");
    }

    #[test]
    fn remote_lines_without_an_ssh_scheme_are_left_alone() {
        assert_eq!(
            rewrite_remote_line("- https://github.com/org/base", "deploy"),
            "- https://github.com/org/base"
        );
        assert_eq!(
            rewrite_remote_line("  - ssh://git@github.com:org/base", "deploy"),
            "  - ssh://git@deploy_github_com:org/base"
        );
    }
}
