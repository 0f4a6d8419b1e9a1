use thiserror::Error;

#[derive(Debug, Error)]
pub enum TillerError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster already exists: {0}")]
    ClusterExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("a command is already pending on node {0}")]
    CommandPending(String),

    #[error("unknown {what} plugin '{plugin}' referenced by '{key}'")]
    UnknownPlugin {
        what: &'static str,
        key: String,
        plugin: String,
    },

    #[error("duplicate {1} plugin config: {0}")]
    DuplicatePlugin(String, &'static str),

    #[error("{what} plugin '{key}' has no global base config")]
    MissingBaseConfig { what: &'static str, key: String },

    #[error("{what} plugin '{key}' is missing the 'plugin' field")]
    MissingPluginField { what: &'static str, key: String },

    #[error("missing required config '{0}'")]
    MissingConfig(String),

    #[error("invalid config '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("action '{action}' is not enabled on cluster {cluster}")]
    ActionDisabled { action: String, cluster: String },

    #[error("missing required field owner")]
    MissingOwner,

    #[error("invalid id '{0}': expected <millis>_<uuid>")]
    InvalidId(String),

    #[error("timed out waiting for completion")]
    WaitTimeout,

    #[error("audit store error: {0}")]
    Audit(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("{0}")]
    Plugin(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TillerError>;
