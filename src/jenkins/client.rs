use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{JenkinsError, Result};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const LOG_STREAM_CHANNEL_CAPACITY: usize = 64;

/// Job metadata, as much of `api/json` as the engine needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub next_build_number: u64,
}

/// Build metadata, as much of `api/json` as the engine needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub number: u64,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb: String,
    crumb_request_field: String,
}

/// One event on a build's live log stream. Exactly one of `End` or
/// `Error` is delivered per stream, after which no further events
/// follow.
#[derive(Debug)]
pub enum LogEvent {
    Chunk(String),
    End,
    Error(JenkinsError),
}

/// A live console-log stream for one build, backed by a polling task.
///
/// Dropping the stream aborts the poller.
pub struct LogStream {
    receiver: mpsc::Receiver<LogEvent>,
    task: JoinHandle<()>,
}

impl LogStream {
    pub async fn next(&mut self) -> Option<LogEvent> {
        self.receiver.recv().await
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Authenticated transport handle for one Jenkins server.
///
/// Construction never touches the network; the first request does.
/// When the crumb issuer is enabled the CSRF crumb is fetched lazily
/// and cached for the lifetime of the handle.
pub struct JenkinsClient {
    client: Client,
    base_url: Url,
    user: Option<String>,
    password: Option<String>,
    use_crumb_issuer: bool,
    crumb: tokio::sync::Mutex<Option<Crumb>>,
}

impl JenkinsClient {
    pub fn new(
        base_url: &str,
        user: Option<&str>,
        password: Option<&str>,
        use_crumb_issuer: bool,
        reject_unauthorized_cert: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("jenkins-runner/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!reject_unauthorized_cert)
            .build()
            .map_err(|e| JenkinsError::Config(format!("Failed to create HTTP client: {e}")))?;

        let base_url = Url::parse(base_url)
            .map_err(|e| JenkinsError::Config(format!("Invalid base URL: {e}")))?;

        if base_url.cannot_be_a_base() {
            return Err(JenkinsError::Config(format!(
                "Invalid base URL: {base_url}"
            )));
        }

        Ok(Self {
            client,
            base_url,
            user: user.map(ToString::to_string),
            password: password.map(ToString::to_string),
            use_crumb_issuer,
            crumb: tokio::sync::Mutex::new(None),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        Err(JenkinsError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn crumb_header(&self) -> Result<Option<(String, String)>> {
        if !self.use_crumb_issuer {
            return Ok(None);
        }

        let mut cached = self.crumb.lock().await;
        if cached.is_none() {
            let url = self.endpoint(&["crumbIssuer", "api", "json"]);
            debug!("Fetching CSRF crumb from {url}");
            let response = Self::check(self.request(Method::GET, url).send().await?).await?;
            *cached = Some(response.json::<Crumb>().await?);
        }

        Ok(cached
            .clone()
            .map(|crumb| (crumb.crumb_request_field, crumb.crumb)))
    }

    async fn post(&self, url: Url) -> Result<RequestBuilder> {
        let mut builder = self.request(Method::POST, url);
        if let Some((field, value)) = self.crumb_header().await? {
            builder = builder.header(field.as_str(), value);
        }
        Ok(builder)
    }

    /// Fetches a job's persisted `config.xml`.
    pub async fn fetch_job_config(&self, job: &str) -> Result<String> {
        let url = self.endpoint(&["job", job, "config.xml"]);
        debug!("GET {url}");
        let response = Self::check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.text().await?)
    }

    /// Replaces a job's persisted `config.xml`.
    pub async fn push_job_config(&self, job: &str, config_xml: &str) -> Result<()> {
        let url = self.endpoint(&["job", job, "config.xml"]);
        debug!("POST {url}");
        let builder = self.post(url).await?;
        Self::check(
            builder
                .header(CONTENT_TYPE, "text/xml")
                .body(config_xml.to_string())
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    pub async fn fetch_job_info(&self, job: &str) -> Result<JobInfo> {
        let url = self.endpoint(&["job", job, "api", "json"]);
        debug!("GET {url}");
        let response = Self::check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Triggers a build, with form-encoded parameters when any are
    /// supplied. The call returns as soon as Jenkins has queued the
    /// build; the build itself may not be visible yet.
    pub async fn trigger_build(
        &self,
        job: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<()> {
        let builder = if parameters.is_empty() {
            self.post(self.endpoint(&["job", job, "build"])).await?
        } else {
            self.post(self.endpoint(&["job", job, "buildWithParameters"]))
                .await?
                .form(parameters)
        };

        Self::check(builder.send().await?).await?;
        Ok(())
    }

    pub async fn fetch_build_info(&self, job: &str, number: u64) -> Result<BuildInfo> {
        let url = self.endpoint(&["job", job, &number.to_string(), "api", "json"]);
        debug!("GET {url}");
        let response = Self::check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Fetches the complete console log in one shot.
    pub async fn fetch_build_log(&self, job: &str, number: u64) -> Result<String> {
        let url = self.endpoint(&["job", job, &number.to_string(), "consoleText"]);
        debug!("GET {url}");
        let response = Self::check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.text().await?)
    }

    pub async fn stop_build(&self, job: &str, number: u64) -> Result<()> {
        let url = self.endpoint(&["job", job, &number.to_string(), "stop"]);
        debug!("POST {url}");
        Self::check(self.post(url).await?.send().await?).await?;
        Ok(())
    }

    /// Opens a live log stream for a build.
    ///
    /// Jenkins exposes incremental console output through
    /// `logText/progressiveText`: each response carries the next text
    /// chunk plus `X-Text-Size` (the offset to resume from) and
    /// `X-More-Data` (whether the build is still producing output).
    /// A spawned task polls that endpoint at a fixed interval and
    /// forwards events over a channel.
    pub fn stream_log(self: Arc<Self>, job: &str, number: u64) -> LogStream {
        let (sender, receiver) = mpsc::channel(LOG_STREAM_CHANNEL_CAPACITY);
        let client = self;
        let job = job.to_string();

        let task = tokio::spawn(async move {
            client.poll_progressive_log(&job, number, sender).await;
        });

        LogStream { receiver, task }
    }

    async fn poll_progressive_log(&self, job: &str, number: u64, sender: mpsc::Sender<LogEvent>) {
        let mut start: u64 = 0;

        loop {
            let mut url =
                self.endpoint(&["job", job, &number.to_string(), "logText", "progressiveText"]);
            url.query_pairs_mut().append_pair("start", &start.to_string());

            let response = match self.request(Method::GET, url).send().await {
                Ok(response) => response,
                Err(e) => {
                    let _ = sender.send(LogEvent::Error(e.into())).await;
                    return;
                }
            };

            let response = match Self::check(response).await {
                Ok(response) => response,
                Err(e) => {
                    let _ = sender.send(LogEvent::Error(e)).await;
                    return;
                }
            };

            let more_data = response
                .headers()
                .get("x-more-data")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

            let next_start = response
                .headers()
                .get("x-text-size")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(start);

            let chunk = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    let _ = sender.send(LogEvent::Error(e.into())).await;
                    return;
                }
            };

            if !chunk.is_empty() && sender.send(LogEvent::Chunk(chunk)).await.is_err() {
                // consumer went away
                return;
            }

            if !more_data {
                let _ = sender.send(LogEvent::End).await;
                return;
            }

            start = next_start;
            tokio::time::sleep(LOG_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymous(url: &str) -> Arc<JenkinsClient> {
        Arc::new(JenkinsClient::new(url, None, None, false, true).unwrap())
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(JenkinsClient::new("not a url", None, None, true, true).is_err());
        assert!(JenkinsClient::new("mailto:someone", None, None, true, true).is_err());
    }

    #[tokio::test]
    async fn test_fetch_job_info_parses_next_build_number() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/job/test-job/api/json")
            .with_body(r#"{"name":"test-job","nextBuildNumber":7,"buildable":true}"#)
            .create_async()
            .await;

        let client = anonymous(&server.url());
        let info = client.fetch_job_info("test-job").await.unwrap();

        assert_eq!(info.next_build_number, 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_job_name_is_percent_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/job/my%20job/config.xml")
            .with_body("<flow-definition/>")
            .create_async()
            .await;

        let client = anonymous(&server.url());
        client.fetch_job_config("my job").await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_maps_to_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/job/missing/api/json")
            .with_status(404)
            .with_body("job missing not found")
            .create_async()
            .await;

        let client = anonymous(&server.url());
        let err = client.fetch_job_info("missing").await.unwrap_err();

        match err {
            JenkinsError::Api { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("not found"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_basic_auth_is_attached() {
        let mut server = mockito::Server::new_async().await;
        // base64("user:pass")
        let mock = server
            .mock("GET", "/job/test/api/json")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .with_body(r#"{"nextBuildNumber":1}"#)
            .create_async()
            .await;

        let client = Arc::new(
            JenkinsClient::new(&server.url(), Some("user"), Some("pass"), false, true).unwrap(),
        );
        client.fetch_job_info("test").await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_crumb_is_fetched_once_and_attached_to_posts() {
        let mut server = mockito::Server::new_async().await;
        let crumb_mock = server
            .mock("GET", "/crumbIssuer/api/json")
            .with_body(r#"{"crumb":"abc123","crumbRequestField":"Jenkins-Crumb"}"#)
            .expect(1)
            .create_async()
            .await;
        let config_mock = server
            .mock("POST", "/job/test/config.xml")
            .match_header("jenkins-crumb", "abc123")
            .expect(2)
            .create_async()
            .await;

        let client = Arc::new(
            JenkinsClient::new(&server.url(), None, None, true, true).unwrap(),
        );
        client.push_job_config("test", "<flow-definition/>").await.unwrap();
        client.push_job_config("test", "<flow-definition/>").await.unwrap();

        crumb_mock.assert_async().await;
        config_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_crumb_issuer_disabled_is_never_contacted() {
        let mut server = mockito::Server::new_async().await;
        let crumb_mock = server
            .mock("GET", "/crumbIssuer/api/json")
            .expect(0)
            .create_async()
            .await;
        server
            .mock("POST", "/job/test/build")
            .create_async()
            .await;

        let client = anonymous(&server.url());
        client.trigger_build("test", &BTreeMap::new()).await.unwrap();

        crumb_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_trigger_with_parameters_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/job/test/buildWithParameters")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("FOO".into(), "bar".into()),
                mockito::Matcher::UrlEncoded("BAZ".into(), "qux quux".into()),
            ]))
            .create_async()
            .await;

        let client = anonymous(&server.url());
        let parameters = BTreeMap::from([
            ("FOO".to_string(), "bar".to_string()),
            ("BAZ".to_string(), "qux quux".to_string()),
        ]);
        client.trigger_build("test", &parameters).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_log_delivers_chunks_then_end() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/job/test/5/logText/progressiveText")
            .match_query(mockito::Matcher::UrlEncoded("start".into(), "0".into()))
            .with_header("x-text-size", "1")
            .with_header("x-more-data", "true")
            .with_body("a")
            .create_async()
            .await;
        server
            .mock("GET", "/job/test/5/logText/progressiveText")
            .match_query(mockito::Matcher::UrlEncoded("start".into(), "1".into()))
            .with_header("x-text-size", "2")
            .with_body("b")
            .create_async()
            .await;

        let client = anonymous(&server.url());
        let mut stream = client.stream_log("test", 5);

        let mut chunks = Vec::new();
        loop {
            match stream.next().await {
                Some(LogEvent::Chunk(text)) => chunks.push(text),
                Some(LogEvent::End) => break,
                other => panic!("unexpected stream event: {other:?}"),
            }
        }

        assert_eq!(chunks, vec!["a", "b"]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_log_surfaces_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/job/test/5/logText/progressiveText")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = anonymous(&server.url());
        let mut stream = client.stream_log("test", 5);

        match stream.next().await {
            Some(LogEvent::Error(JenkinsError::Api { status, .. })) => assert_eq!(status, 500),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }
}
