use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ResolvedJob, Settings};
use crate::jenkins::HostRegistry;
use crate::output;

#[derive(Parser)]
#[command(name = "jenkins-runner")]
#[command(author, version, about = "Run pipeline scripts on a Jenkins server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file path (default: ./jenkins-runner.{toml,json,yaml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline script as a one-off build and stream its output
    Run {
        /// Path to the Groovy pipeline script
        script: PathBuf,

        /// Job friendly name; the default job when omitted
        #[arg(short, long)]
        job: Option<String>,

        /// Host friendly name; the job's first "runWith" host when omitted
        #[arg(long)]
        host: Option<String>,

        /// Extra build parameters as KEY=VALUE, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Password or API token for the host's user
        #[arg(short = 'P', long, env = "JENKINS_PASSWORD")]
        password: Option<String>,
    },

    /// List configured jobs and the hosts they run on
    Jobs,
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        let settings = Settings::load(self.config.as_deref())?;

        match &self.command {
            Commands::Run {
                script,
                job,
                host,
                params,
                password,
            } => {
                self.execute_run(
                    &settings,
                    script,
                    job.as_deref(),
                    host.as_deref(),
                    params,
                    password.as_deref(),
                )
                .await
            }
            Commands::Jobs => self.execute_jobs(&settings),
        }
    }

    async fn execute_run(
        &self,
        settings: &Settings,
        script: &Path,
        job_name: Option<&str>,
        host_name: Option<&str>,
        params: &[String],
        password: Option<&str>,
    ) -> Result<()> {
        let script_text = std::fs::read_to_string(script)
            .with_context(|| format!("Failed to read script: {}", script.display()))?;

        let (jobs, warnings) = settings.resolve_jobs()?;
        for warning in &warnings {
            eprintln!("{}", output::bright_red(warning));
        }
        let job = resolve_job(&jobs, job_name)?;

        let (host_friendly_name, host) = match host_name {
            Some(name) => job
                .hosts
                .iter()
                .find(|(friendly_name, _)| friendly_name == name)
                .ok_or_else(|| {
                    anyhow!("job {} cannot run on host {name}", job.friendly_name)
                })?,
            None => job
                .hosts
                .first()
                .context("job has no hosts to run on")?,
        };

        info!(
            "Running job {} ({}) on {host_friendly_name} ({})",
            job.friendly_name, job.name, host.url
        );

        let mut parameters = job.parameters.clone();
        for param in params {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid --param {param}, expected KEY=VALUE"))?;
            parameters.insert(key.to_string(), value.to_string());
        }

        let registry = Arc::new(HostRegistry::new());
        let connection = registry.get_or_create(&host.url, host.user.as_deref());

        let password = password.or(host.password.as_deref());
        connection.update_credentials(
            host.use_crumb_issuer,
            host.reject_unauthorized_cert,
            password,
        )?;

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let build = connection.create_build(
            &job.name,
            &script_text,
            parameters,
            Box::new(|text| {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }),
            Box::new(move |err| {
                let _ = done_tx.send(err);
            }),
        )?;

        build.start().await?;
        eprintln!("{}", output::dim(format!("Started {}", build.description())));

        // Ctrl-C asks the server to stop the build; the run still ends
        // through the stream's own terminal event.
        let stop_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", output::dim("Interrupted, requesting build stop..."));
                stop_registry.stop_all().await;
            }
        });

        let err = done_rx
            .await
            .context("build ended without reporting a result")?;

        output::print_groovy_errors(&build.errors());
        build.destroy();

        match err {
            None => {
                eprintln!("{}", output::bright_green("Build finished successfully"));
                Ok(())
            }
            Some(err) => Err(err.into()),
        }
    }

    fn execute_jobs(&self, settings: &Settings) -> Result<()> {
        let (jobs, warnings) = settings.resolve_jobs()?;
        for warning in &warnings {
            eprintln!("{}", output::bright_red(warning));
        }

        if jobs.is_empty() {
            println!("No jobs defined in settings");
            return Ok(());
        }

        for job in &jobs {
            let marker = if job.is_default { " (default)" } else { "" };
            let hosts = job
                .hosts
                .iter()
                .map(|(friendly_name, host)| format!("{friendly_name} [{}]", host.url))
                .collect::<Vec<_>>()
                .join(", ");
            println!("{}{marker}: {} on {hosts}", job.friendly_name, job.name);
        }

        Ok(())
    }
}

fn resolve_job<'a>(jobs: &'a [ResolvedJob], name: Option<&str>) -> Result<&'a ResolvedJob> {
    match name {
        Some(name) => jobs
            .iter()
            .find(|job| job.friendly_name == name)
            .ok_or_else(|| anyhow!("job {name} is not defined in settings")),
        None => Settings::default_job(jobs)
            .ok_or_else(|| anyhow!("no default job configured - pass --job")),
    }
}
