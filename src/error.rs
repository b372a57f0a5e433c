//! Error types for the converge operator

use kube::runtime::finalizer::Error as FinalizerError;
use thiserror::Error;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes client error without a specific object in scope
    #[error("Kubernetes API error: {0}")]
    KubeError(String),

    /// A call against a single object failed
    #[error("failed to {verb} {kind} {}: {source}", display_object(namespace.as_deref(), name))]
    ApiError {
        verb: &'static str,
        kind: &'static str,
        namespace: Option<String>,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// A desired resource could not be turned into a typed object
    #[error("Conversion error: {0}")]
    ConversionError(String),

    /// A label selector clause could not be parsed
    #[error("Selector error: {0}")]
    SelectorError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Adding or removing the Alert finalizer failed, or the wrapped pass did
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

fn display_object(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

impl Error {
    /// Returns a closure that wraps a `kube::Error` raised while acting on one object.
    ///
    /// Meant for `map_err`:
    ///
    /// ```ignore
    /// api.create(&pp, &obj).await.map_err(Error::api("create", "ConfigMap", ns, &name))?;
    /// ```
    pub fn api<'a>(
        verb: &'static str,
        kind: &'static str,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> impl FnOnce(kube::Error) -> Error + 'a {
        move |source| Error::ApiError {
            verb,
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            source,
        }
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Conflicts (stale `resourceVersion`), throttling, server-side failures and
    /// transport errors are transient. Conversion, selector, config and
    /// validation errors will fail the same way until the input changes, and so
    /// does a create that hits an existing object the selector does not cover.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError(_) => true,
            Error::ApiError { verb, source, .. } => {
                !(*verb == "create" && is_already_exists(source)) && is_transient_kube_error(source)
            }
            Error::FinalizerError(err) => match err.as_ref() {
                FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => {
                    e.is_transient()
                }
                FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => {
                    is_transient_kube_error(e)
                }
                _ => false,
            },
            Error::ConversionError(_)
            | Error::SelectorError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::SerializationError(_) => false,
        }
    }

    /// HTTP status code returned by the API server, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::ApiError {
                source: kube::Error::Api(resp),
                ..
            } => Some(resp.code),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ApiError { .. } => "api",
            Error::ConversionError(_) => "conversion",
            Error::SelectorError(_) => "selector",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::SerializationError(_) => "serialization",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code == 409 || resp.code == 429 || resp.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}
