use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::task::TaskRequest;

/// Prefijo que marca un argumento como puntero al storage:
/// `S3<algo>={"Bucket": "...", "Key": "..."}`
pub const STORAGE_MARKER: &str = "S3";

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("solicitud vacía, no hay nada que ejecutar")]
    Empty,

    #[error("puntero al storage mal formado: {0}")]
    MalformedPointer(String),

    #[error("ubicación de storage inválida: {0}")]
    InvalidLocation(#[source] serde_json::Error),

    #[error("JSON inválido en la solicitud: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("descriptor de tarea inválido: {0}")]
    InvalidTask(#[source] serde_json::Error),

    #[error("forma de solicitud no soportada: se esperaba objeto o lista, llegó {0}")]
    UnexpectedShape(&'static str),
}

/// Ubicación de un objeto en el storage, con los nombres de campo de S3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Resultado de interpretar un documento de solicitud.
#[derive(Debug, Clone)]
pub enum Resolved {
    Single(Box<TaskRequest>),
    /// Cola de solicitudes crudas (cada una: JSON inline o puntero).
    Batch(Vec<String>),
}

/// Un argumento crudo ya clasificado.
#[derive(Debug, Clone)]
pub enum RequestArg {
    /// Hay que traer el contenido del storage y volver a interpretarlo.
    Pointer(ObjectLocation),
    Inline(Resolved),
}

impl RequestArg {
    pub fn parse(raw: &str) -> Result<Self, RequestError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RequestError::Empty);
        }

        if raw.starts_with(STORAGE_MARKER) {
            let (_, location) = raw
                .split_once('=')
                .ok_or_else(|| RequestError::MalformedPointer(raw.to_string()))?;
            let location: ObjectLocation =
                serde_json::from_str(location).map_err(RequestError::InvalidLocation)?;
            return Ok(RequestArg::Pointer(location));
        }

        let value: Value = serde_json::from_str(raw).map_err(RequestError::InvalidJson)?;
        Resolved::from_value(value).map(RequestArg::Inline)
    }
}

impl Resolved {
    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        match value {
            Value::Array(entries) => Ok(Resolved::Batch(
                entries
                    .into_iter()
                    .map(|entry| match entry {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            Value::Object(_) => {
                let task: TaskRequest =
                    serde_json::from_value(value).map_err(RequestError::InvalidTask)?;
                Ok(Resolved::Single(Box::new(task)))
            }
            Value::Null => Err(RequestError::UnexpectedShape("null")),
            Value::Bool(_) => Err(RequestError::UnexpectedShape("booleano")),
            Value::Number(_) => Err(RequestError::UnexpectedShape("número")),
            Value::String(_) => Err(RequestError::UnexpectedShape("string")),
        }
    }
}
