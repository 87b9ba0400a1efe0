mod build;
mod client;
mod config_xml;
mod error_parser;
mod host;

pub use build::{BuildState, DoneHandler, LogHandler, PipelineBuild};
pub use client::{BuildInfo, JenkinsClient, JobInfo, LogEvent, LogStream};
pub use config_xml::inject_pipeline_script;
pub use error_parser::{parse_groovy_errors, GroovyError};
pub use host::{HostConnection, HostRegistry};
