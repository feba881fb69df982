//! Error taxonomy for routing and monitoring

/// Failure talking to the service registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        RegistryError::Unavailable(error_chain(&e))
    }
}

/// Render an error with all of its causes, `outer: inner: root`
pub(crate) fn error_chain(e: &dyn std::error::Error) -> String {
    let mut detail = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

/// Classified outcome of a failed dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Bad caller input; no network call was made
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("service {service} unavailable: {source}")]
    ServiceUnavailable {
        service: String,
        #[source]
        source: RegistryError,
    },

    #[error("no instance found for service {0}")]
    NoInstanceFound(String),

    /// The chosen instance answered with a failure or could not be reached
    #[error("upstream {endpoint} failed: {}", describe_upstream(.status, .detail))]
    Upstream {
        endpoint: String,
        status: Option<u16>,
        detail: String,
    },
}

fn describe_upstream(status: &Option<u16>, detail: &str) -> String {
    match status {
        Some(code) => format!("status {}: {}", code, detail),
        None => detail.to_string(),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("{0} is not being watched")]
    NotWatched(String),

    #[error("reachability monitor is stopped")]
    Stopped,
}
