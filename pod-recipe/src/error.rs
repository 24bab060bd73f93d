use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors that abort an image build. None of them are retried; the recipe has
/// to be corrected and the build started again.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("base image reference {reference:?} is not pinned: {reason}")]
    UnpinnedBaseImage { reference: String, reason: String },

    #[error("invalid base image reference {0:?}")]
    InvalidImageReference(String),

    #[error("dependency manifest {0:?} does not exist")]
    MissingManifest(PathBuf),

    #[error("dependency manifest line {line}: {reason}")]
    InvalidRequirement { line: usize, reason: String },

    #[error("dependency manifest lists {name:?} more than once (lines {first} and {second})")]
    DuplicateRequirement {
        name: String,
        first: usize,
        second: usize,
    },

    #[error("application source tree {0:?} does not exist or is not a directory")]
    MissingPayload(PathBuf),

    #[error("invalid entry point {reference:?}: {reason}")]
    InvalidEntryPoint { reference: String, reason: String },

    #[error("invalid execution identity: {0}")]
    InvalidIdentity(String),

    #[error("uid {uid} already exists in base image {image}")]
    IdentityCollision { uid: u32, image: String },

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("unknown log level {0:?}, expected one of debug, info, warning, error, critical")]
    InvalidLogLevel(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that stop the application server from ever serving. The launcher
/// exits non-zero on all of them and leaves restarts to the container runtime.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("entry point {reference:?} cannot be resolved: {reason}")]
    UnresolvedEntryPoint { reference: String, reason: String },

    #[error("could not switch to uid {uid}: {reason}")]
    Deescalation { uid: u32, reason: String },

    #[error("could not start server {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("server exited with {0}")]
    ServerExited(String),

    #[error("illegal launch state transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: crate::launcher::LaunchState,
        to: crate::launcher::LaunchState,
    },
}
