use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{info, warn};

use super::build::{DoneHandler, LogHandler, PipelineBuild};
use super::client::JenkinsClient;
use crate::error::{JenkinsError, Result};

type HostKey = (String, Option<String>);

/// Owns one `HostConnection` per `(base URL, user)` identity.
///
/// The registry is an ordinary owned value, not process-global state,
/// so callers (and tests) construct isolated instances and inject them
/// where needed.
pub struct HostRegistry {
    hosts: Mutex<HashMap<HostKey, Arc<HostConnection>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the connection for `(base_url, user)`, creating it on
    /// first reference. Never performs network I/O.
    pub fn get_or_create(&self, base_url: &str, user: Option<&str>) -> Arc<HostConnection> {
        let key = (base_url.to_string(), user.map(ToString::to_string));
        let mut hosts = self.hosts.lock().unwrap();
        Arc::clone(
            hosts
                .entry(key)
                .or_insert_with(|| HostConnection::new(base_url, user)),
        )
    }

    pub fn connections(&self) -> Vec<Arc<HostConnection>> {
        self.hosts.lock().unwrap().values().cloned().collect()
    }

    /// True when any registered build on any connection is still in
    /// flight.
    pub fn any_running(&self) -> bool {
        self.connections()
            .iter()
            .any(|connection| connection.builds().iter().any(|build| build.running()))
    }

    /// Requests a stop for every in-flight build. Best effort; stop
    /// failures are logged and skipped.
    pub async fn stop_all(&self) {
        for connection in self.connections() {
            for build in connection.builds() {
                if build.running() {
                    if let Err(e) = build.stop().await {
                        warn!("Failed to stop {}: {e}", build.description());
                    }
                }
            }
        }
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical connection to one Jenkins server as one user.
///
/// Holds the authenticated transport handle (absent until
/// `update_credentials` is called) and the registry of builds created
/// through it. Credential updates swap the handle in place; builds
/// already holding the old handle keep using it.
pub struct HostConnection {
    weak_self: Weak<HostConnection>,
    base_url: String,
    user: Option<String>,
    client: RwLock<Option<Arc<JenkinsClient>>>,
    builds: Mutex<Vec<Arc<PipelineBuild>>>,
}

impl HostConnection {
    fn new(base_url: &str, user: Option<&str>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            base_url: base_url.to_string(),
            user: user.map(ToString::to_string),
            client: RwLock::new(None),
            builds: Mutex::new(Vec::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn description(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.base_url),
            None => self.base_url.clone(),
        }
    }

    /// (Re)builds the connection's transport handle.
    ///
    /// A password requires a user and vice versa; supplying one
    /// without the other is a configuration error, raised here before
    /// any network call rather than degrading to anonymous access.
    pub fn update_credentials(
        &self,
        use_crumb_issuer: bool,
        reject_unauthorized_cert: bool,
        password: Option<&str>,
    ) -> Result<()> {
        match (&self.user, password) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(JenkinsError::Config(
                    "a user and password must be supplied together - got one without the other"
                        .to_string(),
                ));
            }
            _ => {}
        }

        // don't log passwords!
        info!(
            "Creating Jenkins client for {} (user={}, crumb issuer={}, password={})",
            self.base_url,
            self.user.as_deref().unwrap_or("<none>"),
            use_crumb_issuer,
            if password.is_some() { "****" } else { "" },
        );

        let client = Arc::new(JenkinsClient::new(
            &self.base_url,
            self.user.as_deref(),
            password,
            use_crumb_issuer,
            reject_unauthorized_cert,
        )?);

        *self.client.write().unwrap() = Some(client);
        Ok(())
    }

    pub(crate) fn client(&self) -> Result<Arc<JenkinsClient>> {
        self.client.read().unwrap().clone().ok_or_else(|| {
            JenkinsError::Config(format!(
                "no credentials configured for {} - call update_credentials first",
                self.description()
            ))
        })
    }

    /// Creates and registers a build against the connection's current
    /// transport handle. The build stays registered until it is
    /// destroyed.
    pub fn create_build(
        &self,
        job_name: &str,
        script: &str,
        parameters: BTreeMap<String, String>,
        log_handler: LogHandler,
        done_handler: DoneHandler,
    ) -> Result<Arc<PipelineBuild>> {
        let client = self.client()?;
        let build = PipelineBuild::new(
            self.weak_self.clone(),
            client,
            job_name,
            script,
            parameters,
            log_handler,
            done_handler,
        );
        self.builds.lock().unwrap().push(Arc::clone(&build));
        Ok(build)
    }

    pub fn builds(&self) -> Vec<Arc<PipelineBuild>> {
        self.builds.lock().unwrap().clone()
    }

    pub(crate) fn remove_build(&self, build: &Arc<PipelineBuild>) {
        self.builds
            .lock()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, build));
    }
}
