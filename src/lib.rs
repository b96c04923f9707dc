use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("{kind} {name} does not exist")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Object store is unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Access code {code} is already claimed by ScheduledEvent {owner}")]
    AccessCodeCollision { code: String, owner: String },

    #[error("Not yet ready: {message}")]
    NotReady {
        message: String,
        reason: String,
        requeue_after: Option<Duration>,
    },

    #[error("Leader lease error: {0}")]
    LeaseError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Conflict { .. } => "Conflict",
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::StoreUnavailable(_) => "StoreUnavailable",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::AccessCodeCollision { .. } => "AccessCodeCollision",
            Error::NotReady { .. } => "NotReady",
            Error::LeaseError(_) => "LeaseError",
        }
    }

    pub fn not_found<K: kube::Resource<DynamicType = ()>>(name: &str) -> Self {
        Error::NotFound {
            kind: K::kind(&()).into_owned(),
            name: name.to_owned(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Errors that will not go away until somebody edits the object
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec(_) | Error::AccessCodeCollision { .. }
        )
    }
}

/// Process configuration
pub mod config;

pub mod controllers;

/// Lease based leader election
pub mod leader;

/// Work queue, indexed cache and the controller driver
pub mod runtime;

/// Shared helpers used by several controllers
pub mod reconcilers;

/// Hobbyfarm custom resources
pub mod resources;

/// Versioned, watchable object store
pub mod store;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::{Context, State};
pub use metrics::Metrics;
