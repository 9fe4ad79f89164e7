use serde_json::{json, Value};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use common::TaskRequest;

use crate::error::{HandlerError, Result};
use crate::storage::{ObjectStore, StorageError};

/// Baja al directorio de staging los archivos de la tarea que vienen del
/// storage. Las descargas corren en paralelo; la primera que falla corta
/// la etapa (las demás se abortan al soltar el `JoinSet`).
pub async fn download(
    store: Arc<dyn ObjectStore>,
    request: &TaskRequest,
    work_dir: &Path,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|source| HandlerError::StageFile {
            path: work_dir.to_path_buf(),
            source,
        })?;

    let files = request.download_set();
    for skipped in request
        .input_names()
        .iter()
        .filter(|name| !files.contains(name))
    {
        debug!("{} no se descarga, se asume presente localmente", skipped);
    }

    // se valida todo antes de lanzar la primera descarga
    let targets = files
        .into_iter()
        .map(|file| staged_path(work_dir, &file).map(|dest| (file, dest)))
        .collect::<Result<Vec<_>>>()?;

    let mut fetches = JoinSet::new();
    for (file, dest) in targets {
        let store = store.clone();
        let bucket = request.options.bucket.clone();
        let key = request.options.key_for(&file);

        info!("descargando {}/{}", bucket, key);
        fetches.spawn(async move { fetch_one(store.as_ref(), &bucket, &key, dest).await });
    }

    let mut saved = Vec::new();
    while let Some(joined) = fetches.join_next().await {
        saved.push(joined??);
    }

    info!("todos los archivos se descargaron correctamente");
    Ok(saved)
}

/// Ruta local de un archivo de la tarea. Solo se aceptan nombres relativos
/// que queden dentro de `work_dir`.
fn staged_path(work_dir: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

    if escapes {
        error!("{} queda fuera del directorio de staging", name);
        return Err(HandlerError::StageFile {
            path: relative.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "el nombre sale del directorio de staging",
            ),
        });
    }
    Ok(work_dir.join(relative))
}

async fn fetch_one(store: &dyn ObjectStore, bucket: &str, key: &str, dest: PathBuf) -> Result<PathBuf> {
    let data = store.get(bucket, key).await.map_err(|source| {
        error!("error descargando {}/{}", bucket, key);
        HandlerError::Fetch {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        }
    })?;

    let saved = async {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, data).await
    }
    .await;

    if let Err(source) = saved {
        error!("no se pudo guardar {}", dest.display());
        return Err(HandlerError::StageFile { path: dest, source });
    }

    info!("descargado y guardado {}", dest.display());
    Ok(dest)
}

/// Tamaño en bytes, o -1 si no se puede leer el archivo.
pub fn file_size(path: &Path) -> i64 {
    fs::metadata(path)
        .map(|m| m.len() as i64)
        .unwrap_or(-1)
}

/// `[{"<nombre>": <bytes>}, ...]` con rutas relativas al staging.
pub fn size_report(names: &[String], work_dir: &Path) -> Value {
    Value::Array(
        names
            .iter()
            .map(|name| json!({ name.as_str(): file_size(&work_dir.join(name)) }))
            .collect(),
    )
}

/// Sube un archivo local al storage. Los errores quedan en manos de quien
/// llama: en la etapa de subida no cortan el pipeline.
pub async fn upload_file(store: &dyn ObjectStore, bucket: &str, key: &str, path: &Path) -> Result<()> {
    let upload_err = |source: StorageError| HandlerError::Upload {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    };

    let body = tokio::fs::read(path)
        .await
        .map_err(|e| upload_err(StorageError::Io(e)))?;
    store.put(bucket, key, body).await.map_err(upload_err)?;
    Ok(())
}
