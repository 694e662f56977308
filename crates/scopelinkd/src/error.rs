use scopelink_core::config::ConfigError;
use scopelink_services::WorkerError;

/// Failure to bring an endpoint up.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
