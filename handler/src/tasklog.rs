use chrono::Utc;
use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::warn;

/// Log estructurado de una ejecución ("hftrace").
///
/// Se crea uno por tarea y se pasa explícitamente a cada etapa. Las líneas
/// siguen el formato `[<ts>] [INFO] hftrace - <mensaje>`, que es el que
/// leen las herramientas de análisis de los runs.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    write_failed: Arc<AtomicBool>,
}

impl TaskLog {
    pub fn create(dir: &Path, name: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
            write_failed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Escritura síncrona bajo un `std::sync::Mutex`: se llama desde tareas
    /// async, pero son unas pocas líneas cortas por período de muestreo y el
    /// lock nunca se mantiene a través de un `.await`.
    pub fn info(&self, message: impl AsRef<str>) {
        let line = format!(
            "[{}] [INFO] hftrace - {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            message.as_ref()
        );

        let result = match self.file.lock() {
            Ok(mut file) => file.write_all(line.as_bytes()),
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "lock del log envenenado")),
        };

        // avisamos una sola vez por consola
        if let Err(e) = result {
            if !self.write_failed.swap(true, Ordering::Relaxed) {
                warn!("no se pudo escribir en {}: {}", self.path.display(), e);
            }
        }
    }

    /// Vacía y sincroniza a disco (bloqueante). Se llama al cerrar la tarea,
    /// antes de releer el archivo para subirlo.
    pub fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.flush().and_then(|_| file.sync_data()) {
                warn!("no se pudo sincronizar {}: {}", self.path.display(), e);
            }
        }
    }
}
