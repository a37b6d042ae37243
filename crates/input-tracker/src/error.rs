use thiserror::Error;

use crate::surface::SurfaceId;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid tracker configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("surface {0} is already registered")]
    AlreadyRegistered(SurfaceId),

    #[error("surface {0} is not registered")]
    NotRegistered(SurfaceId),

    #[error("activity tracker already started")]
    AlreadyStarted,

    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TrackerError>;
