use tracing::info;

use common::{RequestArg, Resolved};

use crate::error::{HandlerError, Result};
use crate::storage::ObjectStore;

/// Máximo de punteros encadenados que se siguen antes de rendirse.
pub const MAX_INDIRECTION: usize = 8;

/// Convierte una solicitud cruda en una tarea o en una lista de solicitudes,
/// siguiendo los punteros al storage que haga falta.
pub async fn resolve(raw: &str, store: &dyn ObjectStore) -> Result<Resolved> {
    let mut current = raw.to_string();
    let mut hops = 0;

    loop {
        let location = match RequestArg::parse(&current)? {
            RequestArg::Inline(resolved) => return Ok(resolved),
            RequestArg::Pointer(location) => location,
        };

        if hops == MAX_INDIRECTION {
            return Err(HandlerError::TooManyIndirections(MAX_INDIRECTION));
        }
        hops += 1;

        info!("obteniendo la configuración desde el storage: {}", location);
        let body = store
            .get(&location.bucket, &location.key)
            .await
            .map_err(|source| HandlerError::Fetch {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
                source,
            })?;
        current = String::from_utf8_lossy(&body).into_owned();
    }
}
