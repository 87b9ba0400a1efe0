use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use super::client::{JenkinsClient, LogEvent};
use super::config_xml::inject_pipeline_script;
use super::error_parser::{parse_groovy_errors, GroovyError};
use super::host::HostConnection;
use crate::error::{JenkinsError, Result};

const BUILD_FETCH_RETRIES: u32 = 10;
const BUILD_FETCH_DELAY: Duration = Duration::from_millis(100);

/// Called with each console chunk as it arrives, in server order.
pub type LogHandler = Box<dyn Fn(&str) + Send + Sync + 'static>;
/// Called exactly once when the build reaches a terminal state, after
/// the final log fetch and error parse.
pub type DoneHandler = Box<dyn FnOnce(Option<JenkinsError>) + Send + 'static>;

/// Lifecycle of one triggered run. Transitions are monotonic: a build
/// never leaves a terminal state, and `Idle -> Starting` (via
/// `start()`) is the only caller-driven transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Starting,
    Running,
    Done,
    Failed,
    Stopped,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }
}

/// A single-use pipeline run against a pre-existing Jenkins job.
///
/// `start()` pushes the script into the job's persisted config,
/// triggers a build, resolves the assigned build number under server
/// latency, then streams console output until the server reports the
/// stream finished. On either stream outcome the full log is fetched
/// once more (authoritative copy), parsed for Groovy errors, and the
/// done handler is invoked with the terminal error, if any.
pub struct PipelineBuild {
    weak_self: Weak<PipelineBuild>,
    connection: Weak<HostConnection>,
    client: Arc<JenkinsClient>,
    job_name: String,
    script: String,
    parameters: BTreeMap<String, String>,
    state: Mutex<BuildState>,
    build_number: Mutex<Option<u64>>,
    build_log: Mutex<String>,
    errors: Mutex<Vec<GroovyError>>,
    log_handler: LogHandler,
    done_handler: Mutex<Option<DoneHandler>>,
    stop_requested: AtomicBool,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineBuild {
    pub(crate) fn new(
        connection: Weak<HostConnection>,
        client: Arc<JenkinsClient>,
        job_name: &str,
        script: &str,
        parameters: BTreeMap<String, String>,
        log_handler: LogHandler,
        done_handler: DoneHandler,
    ) -> Arc<Self> {
        info!(
            "Creating pipeline build using job {job_name}, with params {:?}",
            parameters
        );

        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            connection,
            client,
            job_name: job_name.to_string(),
            script: script.to_string(),
            parameters,
            state: Mutex::new(BuildState::Idle),
            build_number: Mutex::new(None),
            build_log: Mutex::new(String::new()),
            errors: Mutex::new(Vec::new()),
            log_handler,
            done_handler: Mutex::new(Some(done_handler)),
            stop_requested: AtomicBool::new(false),
            stream_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> BuildState {
        *self.state.lock().unwrap()
    }

    pub fn running(&self) -> bool {
        matches!(self.state(), BuildState::Starting | BuildState::Running)
    }

    pub fn build_number(&self) -> Option<u64> {
        *self.build_number.lock().unwrap()
    }

    pub fn errors(&self) -> Vec<GroovyError> {
        self.errors.lock().unwrap().clone()
    }

    pub fn build_log(&self) -> String {
        self.build_log.lock().unwrap().clone()
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Human-readable identity for status display: job name, build
    /// number once assigned, and connection identity.
    pub fn description(&self) -> String {
        let connection = self
            .connection
            .upgrade()
            .map(|connection| connection.description())
            .unwrap_or_else(|| "<released connection>".to_string());

        match self.build_number() {
            Some(number) => format!("{} #{number} on {connection}", self.job_name),
            None => format!("{} on {connection}", self.job_name),
        }
    }

    // Terminal states are absorbing.
    fn set_state(&self, next: BuildState) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn complete(&self, err: Option<JenkinsError>) {
        if let Some(handler) = self.done_handler.lock().unwrap().take() {
            handler(err);
        }
    }

    /// Launches the build. Valid once, on an `Idle` instance; a second
    /// call is a usage error reporting the already-assigned build
    /// number.
    ///
    /// Remote failures while starting do not surface here: they move
    /// the build to `Failed` and are delivered through the done
    /// handler, so every started build reports its outcome exactly
    /// once, through one channel.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != BuildState::Idle {
                let build_number = *self.build_number.lock().unwrap();
                let msg = JenkinsError::AlreadyStarted {
                    job: self.job_name.clone(),
                    build_number,
                };
                error!("{msg}");
                return Err(msg);
            }
            *state = BuildState::Starting;
        }

        if let Err(err) = self.launch().await {
            error!("Error starting job {}: {err}", self.description());
            self.set_state(BuildState::Failed);
            self.complete(Some(err));
        }

        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        info!("Fetching remote XML config for job {}", self.job_name);
        let config = self.client.fetch_job_config(&self.job_name).await?;

        let updated = inject_pipeline_script(&config, &self.script)?;

        info!("Pushing remote XML config for job {}", self.job_name);
        self.client
            .push_job_config(&self.job_name, &updated)
            .await?;

        info!("Fetching next build number for job {}", self.job_name);
        // Known race: another trigger against this job can claim the
        // predicted number between this read and the trigger below.
        // The bounded lookup loop is the backstop, not a fix.
        let number = self
            .client
            .fetch_job_info(&self.job_name)
            .await?
            .next_build_number;
        *self.build_number.lock().unwrap() = Some(number);
        info!("Next build number: {number}");

        info!("Triggering build #{number} of job {}", self.job_name);
        self.client
            .trigger_build(&self.job_name, &self.parameters)
            .await?;

        let mut found = false;
        for attempt in 1..=BUILD_FETCH_RETRIES {
            match self.client.fetch_build_info(&self.job_name, number).await {
                Ok(_) => {
                    found = true;
                    break;
                }
                Err(err) => {
                    debug!(
                        "Build #{number} not visible yet (attempt {attempt}/{BUILD_FETCH_RETRIES}): {err}"
                    );
                    tokio::time::sleep(BUILD_FETCH_DELAY).await;
                }
            }
        }

        if !found {
            return Err(JenkinsError::BuildNotFound {
                job: self.job_name.clone(),
                number,
                retries: BUILD_FETCH_RETRIES,
            });
        }

        info!("Attaching log stream for build #{number} of job {}", self.job_name);
        let mut stream = Arc::clone(&self.client).stream_log(&self.job_name, number);
        self.set_state(BuildState::Running);

        let build = match self.weak_self.upgrade() {
            Some(build) => build,
            None => return Ok(()),
        };
        let task = tokio::spawn(async move {
            let mut terminal_seen = false;
            while let Some(event) = stream.next().await {
                match event {
                    LogEvent::Chunk(text) => {
                        build.build_log.lock().unwrap().push_str(&text);
                        (build.log_handler)(&text);
                    }
                    LogEvent::End => {
                        terminal_seen = true;
                        build.finalize(number, None).await;
                        break;
                    }
                    LogEvent::Error(err) => {
                        terminal_seen = true;
                        build.finalize(number, Some(err)).await;
                        break;
                    }
                }
            }
            if !terminal_seen {
                let err =
                    JenkinsError::Stream("log stream closed without a terminal event".to_string());
                build.finalize(number, Some(err)).await;
            }
        });
        *self.stream_task.lock().unwrap() = Some(task);

        Ok(())
    }

    /// Runs once per build, on the stream's terminal event. Fetches
    /// the authoritative full log (replacing the streamed
    /// accumulation), parses it for Groovy errors, and delivers the
    /// done callback - also on stream failure, so diagnostics exist
    /// for partially-failed runs.
    async fn finalize(&self, number: u64, stream_error: Option<JenkinsError>) {
        let mut err = stream_error;

        info!("Done job {} #{number}", self.job_name);
        if let Some(e) = &err {
            error!("Build finished with errors: {e}");
        }

        info!("Fetching full build log...");
        match self.client.fetch_build_log(&self.job_name, number).await {
            Ok(full_log) => {
                *self.build_log.lock().unwrap() = full_log;
            }
            Err(e) => {
                warn!("Could not fetch final build log, keeping streamed copy: {e}");
            }
        }

        info!("Parsing build log for errors...");
        {
            let log = self.build_log.lock().unwrap();
            *self.errors.lock().unwrap() = parse_groovy_errors(&log);
        }

        let stopped = self.stop_requested.load(Ordering::Relaxed);

        // A stream that ends cleanly says nothing about the build's
        // outcome; ask the server for the result.
        if err.is_none() && !stopped {
            match self.client.fetch_build_info(&self.job_name, number).await {
                Ok(build_info) => {
                    if let Some(result) = build_info.result {
                        if result != "SUCCESS" {
                            err = Some(JenkinsError::BuildFailed {
                                job: self.job_name.clone(),
                                number,
                                result,
                            });
                        }
                    }
                }
                Err(e) => warn!("Could not fetch final build status: {e}"),
            }
        }

        let terminal = if stopped {
            BuildState::Stopped
        } else if err.is_some() {
            BuildState::Failed
        } else {
            BuildState::Done
        };
        self.set_state(terminal);

        self.complete(err);
    }

    /// Asks the server to stop this build. Does not transition state
    /// by itself: the build goes to `Stopped` when its stream
    /// subsequently reports a terminal event. Benign before a build
    /// number is assigned.
    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::Relaxed);

        let number = match self.build_number() {
            Some(number) => number,
            None => {
                warn!(
                    "Stop requested for {} before a build number was assigned",
                    self.description()
                );
                return Ok(());
            }
        };

        info!("Stopping job {} #{number}", self.job_name);
        self.client.stop_build(&self.job_name, number).await
    }

    /// Releases the build: best-effort stop, detaches the stream,
    /// drops the done handler, and removes the build from its
    /// connection's registry. Idempotent.
    pub fn destroy(&self) {
        if !self.state().is_terminal() {
            self.stop_requested.store(true, Ordering::Relaxed);

            if let Some(number) = self.build_number() {
                let client = Arc::clone(&self.client);
                let job = self.job_name.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.stop_build(&job, number).await {
                        warn!("Failed to stop {job} #{number}: {e}");
                    }
                });
            }
        }

        if let Some(task) = self.stream_task.lock().unwrap().take() {
            task.abort();
        }

        self.done_handler.lock().unwrap().take();

        if let (Some(connection), Some(build)) =
            (self.connection.upgrade(), self.weak_self.upgrade())
        {
            connection.remove_build(&build);
        }
    }
}
