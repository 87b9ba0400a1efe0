use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Settings file structure for jenkins-runner.
///
/// Mirrors the extension-style settings layout: a set of named hosts
/// and a set of named jobs referencing them. Files are loaded from the
/// current directory or a specified path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Jenkins hosts, keyed by friendly name
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,

    /// Jobs a pipeline script can be run on, keyed by friendly name
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Base URL of the Jenkins server
    pub url: String,

    /// User to authenticate as; anonymous when absent
    pub user: Option<String>,

    /// Password or API token; prompting/env lookup is the CLI's job
    pub password: Option<String>,

    /// Fetch and attach a CSRF crumb on modifying calls
    #[serde(default = "default_true")]
    pub use_crumb_issuer: bool,

    /// Refuse TLS certificates that fail validation
    #[serde(default = "default_true")]
    pub reject_unauthorized_cert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Name of the job on the Jenkins server
    pub name: String,

    /// Job picked when the CLI is not told which one to use
    #[serde(default)]
    pub is_default: bool,

    /// Host friendly name(s) this job can run on
    pub run_with: OneOrMany,

    /// Build parameters passed through on trigger
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// `runWith` accepts either a single host name or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name.clone()],
            Self::Many(names) => names.clone(),
        }
    }
}

/// A job with its `runWith` references resolved to host configs.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub friendly_name: String,
    pub name: String,
    pub is_default: bool,
    /// `(friendly name, config)` pairs, in `runWith` order
    pub hosts: Vec<(String, HostConfig)>,
    pub parameters: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from a file.
    ///
    /// Searches for settings files in this order:
    /// 1. Specified path
    /// 2. ./jenkins-runner.toml
    /// 3. ./jenkins-runner.json
    /// 4. ./jenkins-runner.yaml
    /// 5. ./jenkins-runner.yml
    ///
    /// Returns default (empty) settings if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = [
            "jenkins-runner.toml",
            "jenkins-runner.json",
            "jenkins-runner.yaml",
            "jenkins-runner.yml",
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML settings: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON settings: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML settings: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse settings file: {}", path.display())),
        }
    }

    /// Resolves every job's `runWith` references against the host
    /// table.
    ///
    /// Unknown host names produce warnings (returned and logged); a
    /// job left with no resolvable host at all is an error.
    pub fn resolve_jobs(&self) -> Result<(Vec<ResolvedJob>, Vec<String>)> {
        let mut resolved = Vec::new();
        let mut warnings = Vec::new();

        for (friendly_name, job) in &self.jobs {
            let mut hosts = Vec::new();

            for host_name in job.run_with.to_vec() {
                match self.hosts.get(&host_name) {
                    Some(host) => hosts.push((host_name, host.clone())),
                    None => warnings.push(format!(
                        "Host \"{host_name}\" in \"runWith\" field for job {friendly_name} is not defined"
                    )),
                }
            }

            if hosts.is_empty() {
                bail!("job {friendly_name} has no known hosts in its \"runWith\" field");
            }

            resolved.push(ResolvedJob {
                friendly_name: friendly_name.clone(),
                name: job.name.clone(),
                is_default: job.is_default,
                hosts,
                parameters: job.parameters.clone(),
            });
        }

        for warning in &warnings {
            warn!("{warning}");
        }

        Ok((resolved, warnings))
    }

    /// Picks the job marked default, or the only job when exactly one
    /// is configured.
    pub fn default_job(jobs: &[ResolvedJob]) -> Option<&ResolvedJob> {
        jobs.iter().find(|job| job.is_default).or_else(|| {
            if jobs.len() == 1 {
                jobs.first()
            } else {
                None
            }
        })
    }
}
