use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use common::{InvalidTransition, RequestError};

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("no se pudo obtener {bucket}/{key}: {source}")]
    Fetch {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("no se pudo subir {bucket}/{key}: {source}")]
    Upload {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("no se pudo guardar {path}: {source}")]
    StageFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no se pudo dar permisos de ejecución a {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no se pudo lanzar '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{executable}' superó el timeout de {limit:?}")]
    Timeout { executable: String, limit: Duration },

    #[error("no se pudo crear el log de la tarea {path}: {source}")]
    TaskLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("demasiados niveles de indirección en el storage (máximo {0})")]
    TooManyIndirections(usize),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("tarea interna abortada: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, HandlerError>;
