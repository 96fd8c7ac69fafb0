//! Invocation of the apply pipeline.
//!
//! A run is applied either as `kustomize build <path> | kubectl apply -f -`
//! when the subtree root carries a kustomization file, or as a recursive
//! `kubectl apply -R -f <path>`. The invoker carries the delegate bearer
//! token, applies Secrets separately from other resources and scrubs any
//! output that could leak secret data.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::metrics;
use crate::Error;

const KUBECTL: &str = "kubectl";
const KUSTOMIZE: &str = "kustomize";

const OMITTED_TOKEN: &str = "--token=<omitted>";
const OMIT_ERR_OUTPUT_MESSAGE: &str =
    "Some error output has been omitted because it may contain sensitive data\n";

const SECRET_GVK: &str = "core/v1/Secret";

/// Dry-run strategy passed to kubectl
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DryRunStrategy {
    /// Mutate the cluster
    #[default]
    None,
    /// Submit to the apiserver without persisting
    Server,
}

impl fmt::Display for DryRunStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DryRunStrategy::None => write!(f, "none"),
            DryRunStrategy::Server => write!(f, "server"),
        }
    }
}

/// Per-run options for the apply pipeline
#[derive(Clone, Debug, Default)]
pub struct ApplyOptions {
    /// Namespace the manifests are applied into
    pub namespace: String,
    /// Dry-run strategy
    pub dry_run_strategy: DryRunStrategy,
    /// Extra environment for the subprocesses (GIT_SSH_COMMAND, HOME, ...)
    pub environment: Vec<(String, String)>,
    /// Resource kinds passed as `--prune-allowlist` entries
    pub prune_whitelist: Vec<String>,
    /// Use server-side apply
    pub server_side: bool,
    /// Delegate bearer token
    pub token: String,
}

/// Outcome of one apply invocation
#[derive(Clone, Debug, Default)]
pub struct ApplyOutcome {
    /// The logical command, with the token redacted
    pub command: String,
    /// Captured stdout and stderr, scrubbed where secrets are suspected
    pub output: String,
    /// Error description when the pipeline failed
    pub error_message: Option<String>,
}

/// The apply pipeline, mockable for tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplyInvoker: Send + Sync {
    /// Apply the manifests under `root_path` with the given options
    async fn apply(&self, root_path: &Path, options: &ApplyOptions) -> ApplyOutcome;
}

/// [`ApplyInvoker`] that shells out to kubectl and kustomize
#[derive(Clone, Debug)]
pub struct KubectlClient {
    // Overridable to make testing possible
    kubectl_path: String,
    kustomize_path: String,
}

impl Default for KubectlClient {
    fn default() -> Self {
        Self {
            kubectl_path: KUBECTL.to_string(),
            kustomize_path: KUSTOMIZE.to_string(),
        }
    }
}

#[async_trait]
impl ApplyInvoker for KubectlClient {
    async fn apply(&self, root_path: &Path, options: &ApplyOptions) -> ApplyOutcome {
        info!(path = %root_path.display(), namespace = %options.namespace, "applying files");
        if has_kustomization(root_path) {
            self.apply_kustomize(root_path, options).await
        } else {
            self.apply_recursive(root_path, options).await
        }
    }
}

impl KubectlClient {
    /// `kubectl apply -R -f <path>`
    async fn apply_recursive(&self, root_path: &Path, options: &ApplyOptions) -> ApplyOutcome {
        let args = kubectl_args(options, &["-R", "-f", &root_path.to_string_lossy()]);
        let command = render_command(KUBECTL, &args);

        let output = match run_command(&self.kubectl_path, &args, &options.token, options, None).await {
            Ok(output) => output,
            Err(e) => {
                return ApplyOutcome {
                    command,
                    output: String::new(),
                    error_message: Some(e.to_string()),
                }
            }
        };
        let code = output.status.code().unwrap_or(-1);
        metrics::get().update_kubectl_exit_code_count(&options.namespace, code);
        let combined = combined_output(&output);
        if output.status.success() {
            ApplyOutcome {
                command,
                output: combined,
                error_message: None,
            }
        } else {
            ApplyOutcome {
                command,
                output: filter_err_output(&combined),
                error_message: Some(output.status.to_string()),
            }
        }
    }

    /// `kustomize build <path> | kubectl apply -f -`, Secrets applied in a
    /// second invocation whose error output is never surfaced
    async fn apply_kustomize(&self, root_path: &Path, options: &ApplyOptions) -> ApplyOutcome {
        let root = root_path.to_string_lossy();
        let kustomize_args = vec!["build".to_string(), root.into_owned()];
        let kustomize_command = render_command(KUSTOMIZE, &kustomize_args);

        let build = match run_command(&self.kustomize_path, &kustomize_args, "", options, None).await {
            Ok(output) => output,
            Err(e) => {
                return ApplyOutcome {
                    command: kustomize_command,
                    output: String::new(),
                    error_message: Some(e.to_string()),
                }
            }
        };
        if !build.status.success() {
            return ApplyOutcome {
                command: kustomize_command,
                output: String::from_utf8_lossy(&build.stderr).into_owned(),
                error_message: Some(build.status.to_string()),
            };
        }

        let manifests = String::from_utf8_lossy(&build.stdout);
        let (resources, secrets) = match split_secrets(&manifests) {
            Ok(split) => split,
            Err(e) => {
                return ApplyOutcome {
                    command: kustomize_command,
                    output: "error extracting secrets from kustomize output".to_string(),
                    error_message: Some(e.to_string()),
                }
            }
        };
        if resources.is_empty() && secrets.is_empty() {
            return ApplyOutcome {
                command: kustomize_command,
                output: String::new(),
                error_message: Some(
                    "no resources were extracted from the kustomize output".to_string(),
                ),
            };
        }

        // The displayed command carries the full allow-list even though the
        // actual work happens in two kubectl invocations.
        let display_args = kubectl_args(options, &["-f", "-"]);
        let command = format!(
            "{} | {}",
            kustomize_command,
            render_command(KUBECTL, &display_args)
        );

        let mut combined = String::new();

        if !resources.is_empty() {
            let whitelist: Vec<String> = options
                .prune_whitelist
                .iter()
                .filter(|w| w.as_str() != SECRET_GVK)
                .cloned()
                .collect();
            let scoped = ApplyOptions {
                prune_whitelist: whitelist,
                ..options.clone()
            };
            let args = kubectl_args(&scoped, &["-f", "-"]);
            let output = match run_command(&self.kubectl_path, &args, &options.token, options, Some(&resources))
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    return ApplyOutcome {
                        command,
                        output: combined,
                        error_message: Some(e.to_string()),
                    }
                }
            };
            let code = output.status.code().unwrap_or(-1);
            metrics::get().update_kubectl_exit_code_count(&options.namespace, code);
            combined.push_str(&combined_output(&output));
            if !output.status.success() {
                return ApplyOutcome {
                    command,
                    output: filter_err_output(&combined),
                    error_message: Some(output.status.to_string()),
                };
            }
        }

        if !secrets.is_empty() {
            let whitelist: Vec<String> = options
                .prune_whitelist
                .iter()
                .filter(|w| w.as_str() == SECRET_GVK)
                .cloned()
                .collect();
            let scoped = ApplyOptions {
                prune_whitelist: whitelist,
                ..options.clone()
            };
            let args = kubectl_args(&scoped, &["-f", "-"]);
            let output = match run_command(&self.kubectl_path, &args, &options.token, options, Some(&secrets))
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    return ApplyOutcome {
                        command,
                        output: combined,
                        error_message: Some(e.to_string()),
                    }
                }
            };
            let code = output.status.code().unwrap_or(-1);
            metrics::get().update_kubectl_exit_code_count(&options.namespace, code);
            if !output.status.success() {
                // kubectl's error output can echo the content of a Secret
                combined.push_str(OMIT_ERR_OUTPUT_MESSAGE);
                return ApplyOutcome {
                    command,
                    output: combined,
                    error_message: Some(output.status.to_string()),
                };
            }
            combined.push_str(&combined_output(&output));
        }

        ApplyOutcome {
            command,
            output: combined,
            error_message: None,
        }
    }
}

/// Whether the subtree root is a kustomization
fn has_kustomization(root_path: &Path) -> bool {
    ["kustomization.yaml", "kustomization.yml", "Kustomization"]
        .iter()
        .any(|name| root_path.join(name).is_file())
}

/// Compose kubectl apply arguments with the token redacted
fn kubectl_args(options: &ApplyOptions, file_args: &[&str]) -> Vec<String> {
    let mut args = vec![
        "apply".to_string(),
        format!("--dry-run={}", options.dry_run_strategy),
    ];
    args.extend(file_args.iter().map(|a| a.to_string()));
    args.push("-n".to_string());
    args.push(options.namespace.clone());
    args.push(OMITTED_TOKEN.to_string());
    if options.server_side {
        args.push("--server-side".to_string());
    }
    if !options.prune_whitelist.is_empty() {
        args.push("--prune".to_string());
        args.push("--all".to_string());
        for w in &options.prune_whitelist {
            args.push(format!("--prune-allowlist={}", w));
        }
    }
    args
}

/// Render a command line for logs and status
fn render_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Run a subprocess with the per-run environment, substituting the real
/// token for the redacted placeholder
async fn run_command(
    program: &str,
    args: &[String],
    token: &str,
    options: &ApplyOptions,
    stdin: Option<&str>,
) -> Result<std::process::Output, Error> {
    let mut cmd = Command::new(program);
    for arg in args {
        if arg == OMITTED_TOKEN {
            cmd.arg(format!("--token={}", token));
        } else {
            cmd.arg(arg);
        }
    }
    for (k, v) in &options.environment {
        cmd.env(k, v);
    }
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::apply(format!("failed to run {}: {}", program, e)))?;
    if let Some(input) = stdin {
        let mut handle = child
            .stdin
            .take()
            .ok_or_else(|| Error::apply("failed to open subprocess stdin"))?;
        handle
            .write_all(input.as_bytes())
            .await
            .map_err(|e| Error::apply(format!("failed to write to {}: {}", program, e)))?;
        drop(handle);
    }
    child
        .wait_with_output()
        .await
        .map_err(|e| Error::apply(format!("failed to wait for {}: {}", program, e)))
}

fn combined_output(output: &std::process::Output) -> String {
    let mut s = String::from_utf8_lossy(&output.stdout).into_owned();
    s.push_str(&String::from_utf8_lossy(&output.stderr));
    s
}

/// Squash output that may contain leaked secret data
fn filter_err_output(out: &str) -> String {
    if out.contains("Secret") || out.contains("base64") {
        OMIT_ERR_OUTPUT_MESSAGE.to_string()
    } else {
        out.to_string()
    }
}

/// Separate Secret documents from the rest of a multi-document manifest
/// stream so they can be applied (and their errors scrubbed) independently
fn split_secrets(yaml: &str) -> Result<(String, String), Error> {
    let mut resources = Vec::new();
    let mut secrets = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| Error::serialization(format!("failed to unmarshal manifest: {}", e)))?;
        if value.is_null() {
            continue;
        }
        let rendered = serde_yaml::to_string(&value)
            .map_err(|e| Error::serialization(format!("failed to marshal manifest: {}", e)))?;
        if value.get("kind").and_then(|k| k.as_str()) == Some("Secret") {
            secrets.push(rendered);
        } else {
            resources.push(rendered);
        }
    }
    Ok((resources.join("---\n"), secrets.join("---\n")))
}
