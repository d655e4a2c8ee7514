use std::io;

use thiserror::Error;

use crate::auth::CredentialError;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The bind address could not be parsed.
    #[error("invalid bind address `{0}`")]
    InvalidAddress(String),

    /// A configuration value was present but unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker thread could not be started.
    #[error("failed to spawn worker `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A credential collaborator failed to initialize or answer.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// A background thread panicked.
    #[error("thread panicked: {0}")]
    Panic(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
