use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("objeto no encontrado: {0}")]
    NotFound(String),

    #[error("el storage respondió {status} para {url}")]
    Status { status: StatusCode, url: String },

    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("error de I/O: {0}")]
    Io(#[from] io::Error),

    #[error("clave inválida: {0}")]
    InvalidKey(String),

    #[error("endpoint de storage inválido: {0}")]
    InvalidEndpoint(String),
}

/// Storage de objetos donde viven los artefactos de cada tarea.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError>;
}

/// Elige la implementación según el esquema de la URL.
pub fn from_url(url: &str) -> Arc<dyn ObjectStore> {
    match url.strip_prefix("file://") {
        Some(root) => Arc::new(FsObjectStore::new(root)),
        None => Arc::new(HttpObjectStore::new(url)),
    }
}

/* ---------------- S3-compatible por HTTP ---------------- */

/// Acceso path-style `<endpoint>/<bucket>/<key>`, sin firma de requests.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Cada segmento de la clave se codifica por separado: `?`, `#` o
    /// espacios quedan dentro del path.
    fn url(&self, bucket: &str, key: &str) -> Result<Url, StorageError> {
        let invalid = || StorageError::InvalidEndpoint(self.endpoint.clone());
        let mut url = Url::parse(&self.endpoint).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .push(bucket)
            .extend(key.trim_start_matches('/').split('/'));
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.url(bucket, key)?;
        let resp = self.client.get(url.clone()).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(format!("{}/{}", bucket, key))),
            status if !status.is_success() => Err(StorageError::Status {
                status,
                url: url.to_string(),
            }),
            _ => Ok(resp.bytes().await?.to_vec()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let url = self.url(bucket, key)?;
        let resp = self.client.put(url.clone()).body(body).send().await?;

        if !resp.status().is_success() {
            return Err(StorageError::Status {
                status: resp.status(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

/* ---------------- directorio local ---------------- */

/// Cada bucket es un subdirectorio de `root`; cada clave, una ruta relativa.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key.trim_start_matches('/'));
        if bucket.is_empty()
            || bucket.contains('/')
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::InvalidKey(format!("{}/{}", bucket, key)));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("{}/{}", bucket, key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_put_y_get() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());

        store
            .put("b", "p/logs-hf/task-t1@x.log", b"hola".to_vec())
            .await
            .unwrap();

        assert!(tmp.path().join("b/p/logs-hf/task-t1@x.log").is_file());
        let data = store.get("b", "p/logs-hf/task-t1@x.log").await.unwrap();
        assert_eq!(data, b"hola");
    }

    #[tokio::test]
    async fn fs_store_objeto_faltante_es_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path());

        let err = store.get("b", "nada.sh").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn fs_store_rechaza_salir_del_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(tmp.path().join("store"));

        let err = store.put("b", "../../escape", Vec::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn http_store_arma_urls_path_style() {
        let store = HttpObjectStore::new("http://localhost:9000/");
        assert_eq!(
            store.url("b", "p/run.sh").unwrap().as_str(),
            "http://localhost:9000/b/p/run.sh"
        );

        let nested = HttpObjectStore::new("http://minio.local/s3");
        assert_eq!(
            nested.url("b", "/p/run.sh").unwrap().as_str(),
            "http://minio.local/s3/b/p/run.sh"
        );
    }

    #[test]
    fn http_store_codifica_la_clave() {
        let store = HttpObjectStore::new("http://localhost:9000");
        let url = store.url("b", "p/datos 1?v#2.txt").unwrap();

        assert_eq!(url.as_str(), "http://localhost:9000/b/p/datos%201%3Fv%232.txt");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn http_store_con_endpoint_invalido() {
        let store = HttpObjectStore::new("no es una url");
        assert!(matches!(
            store.url("b", "k"),
            Err(StorageError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn from_url_elige_por_esquema() {
        // solo verificamos que ambos caminos construyen un store
        let _fs = from_url("file:///tmp/store");
        let _http = from_url("http://localhost:9000");
    }
}
