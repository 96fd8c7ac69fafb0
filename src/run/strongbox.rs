//! Strongbox keyring provisioning.
//!
//! When a Waybill references a keyring secret, its material is written into
//! the per-run home so that the in-repo decryption filter can decrypt files
//! during checkout and during the manifest build.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

#[cfg(test)]
use mockall::automock;

use super::policy::check_secret_is_allowed;
use crate::client::ClusterClient;
use crate::crd::Waybill;
use crate::Error;

const KEYRING_KEY: &str = ".strongbox_keyring";
const IDENTITY_KEY: &str = ".strongbox_identity";

/// Configures strongbox for a run
#[async_trait]
#[cfg_attr(test, automock)]
pub trait StrongboxProvisioner: Send + Sync {
    /// Materialize the keyring and identity files into the run's home
    /// directory. A Waybill without a keyring reference is a no-op.
    async fn setup_keyring(
        &self,
        cluster: &dyn ClusterClient,
        waybill: &Waybill,
        home_dir: &Path,
    ) -> Result<(), Error>;

    /// Configure the git clean/smudge filter for strongbox in the run's
    /// environment, so decryption also happens for bases cloned during the
    /// manifest build
    async fn setup_git_config(
        &self,
        waybill: &Waybill,
        environment: &[(String, String)],
    ) -> Result<(), Error>;
}

/// [`StrongboxProvisioner`] backed by the strongbox binary
#[derive(Clone, Copy, Debug, Default)]
pub struct Strongboxer;

#[async_trait]
impl StrongboxProvisioner for Strongboxer {
    async fn setup_keyring(
        &self,
        cluster: &dyn ClusterClient,
        waybill: &Waybill,
        home_dir: &Path,
    ) -> Result<(), Error> {
        let Some(secret_ref) = waybill.spec.strongbox_keyring_secret_ref.as_ref() else {
            return Ok(());
        };
        let secret_namespace = secret_ref
            .namespace
            .as_deref()
            .unwrap_or_else(|| waybill.namespace());
        let secret = cluster.get_secret(secret_namespace, &secret_ref.name).await?;
        check_secret_is_allowed(waybill, &secret)?;

        let mut found = false;
        for key in [KEYRING_KEY, IDENTITY_KEY] {
            if let Some(material) = secret.data.as_ref().and_then(|d| d.get(key)) {
                let path = home_dir.join(key);
                std::fs::write(&path, &material.0)?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400))?;
                found = true;
            }
        }
        if !found {
            return Err(Error::secret(format!(
                r#"secret "{}/{}" does not contain key '{}' or '{}'"#,
                secret.metadata.namespace.as_deref().unwrap_or_default(),
                secret.metadata.name.as_deref().unwrap_or_default(),
                KEYRING_KEY,
                IDENTITY_KEY
            )));
        }
        Ok(())
    }

    async fn setup_git_config(
        &self,
        waybill: &Waybill,
        environment: &[(String, String)],
    ) -> Result<(), Error> {
        if waybill.spec.strongbox_keyring_secret_ref.is_none() {
            return Ok(());
        }
        let mut cmd = Command::new("strongbox");
        cmd.arg("-git-config").kill_on_drop(true);
        // The run environment overrides HOME; PATH is inherited so the
        // strongbox binary can be found.
        for (k, v) in environment {
            cmd.env(k, v);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::apply(format!("error running strongbox: {}", e)))?;
        if !output.status.success() {
            return Err(Error::apply(format!(
                "error running strongbox: {}: {}",
                String::from_utf8_lossy(&output.stderr).trim(),
                output.status
            )));
        }
        Ok(())
    }
}
