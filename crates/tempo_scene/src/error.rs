//! Scene graph errors

use tempo_core::TopologyError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("scene wiring failed: {0}")]
    Topology(#[from] TopologyError),

    #[error("a composite view cannot be a node's own object; add it as a child")]
    ViewAsObject,

    #[error("node already holds an object or has children")]
    AlreadySet,
}

pub type Result<T> = std::result::Result<T, SceneError>;
