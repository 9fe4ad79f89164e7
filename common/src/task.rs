use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type TaskId = String;

/// Extensiones que se descargan desde el storage antes de ejecutar.
/// Todo lo demás se asume presente en la imagen de ejecución.
const FETCHED_EXTENSIONS: [&str; 2] = [".js", ".sh"];

/// Largo del identificador corto de cada handler.
const HANDLER_ID_LEN: usize = 10;

/// Descriptor de una tarea del workflow, tal como llega en el argumento
/// del proceso (o dentro de un objeto del storage).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Programa a ejecutar; la extensión decide cómo se lanza.
    pub executable: String,

    /// Argumentos en orden. Acepta strings, números y booleanos.
    #[serde(default, deserialize_with = "scalar_args")]
    pub args: Vec<String>,

    pub options: TaskOptions,

    #[serde(default)]
    pub inputs: Vec<FileRef>,

    #[serde(default)]
    pub outputs: Vec<FileRef>,

    pub task_id: TaskId,

    /// Nombre legible del proceso del workflow (solo para los logs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Metadatos de entorno; se registran pero no se inyectan al hijo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Value>,

    /// Si viene, el stdout del hijo se copia también a este archivo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Campos que no interpretamos, se conservan para el log del job.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
}

/// Forma de lanzar el ejecutable según su extensión.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableKind {
    /// `.js`: se lanza con el runtime de scripts configurado.
    Script,
    /// `.jar`: se lanza con el runtime del host (`java -jar`).
    Archive,
    /// `.sh`: comando de shell.
    Shell,
    /// Cualquier otra cosa: binario nativo o comando de shell.
    Native,
}

impl ExecutableKind {
    pub fn of(executable: &str) -> Self {
        if executable.ends_with(".js") {
            ExecutableKind::Script
        } else if executable.ends_with(".jar") {
            ExecutableKind::Archive
        } else if executable.ends_with(".sh") {
            ExecutableKind::Shell
        } else {
            ExecutableKind::Native
        }
    }

    /// Scripts y shell se bajan del storage y necesitan permisos de ejecución.
    pub fn is_fetched(self) -> bool {
        matches!(self, ExecutableKind::Script | ExecutableKind::Shell)
    }
}

/// Indica si un archivo se descarga desde el storage.
pub fn is_fetched_file(name: &str) -> bool {
    FETCHED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

impl TaskOptions {
    /// Clave del objeto `<prefix>/<name>` dentro del bucket.
    pub fn key_for(&self, name: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    /// Clave donde se sube el log de una ejecución.
    pub fn log_key(&self, log_name: &str) -> String {
        self.key_for(&format!("logs-hf/{}", log_name))
    }
}

impl TaskRequest {
    pub fn kind(&self) -> ExecutableKind {
        ExecutableKind::of(&self.executable)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|f| f.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|f| f.name.clone()).collect()
    }

    /// Archivos a bajar: inputs + ejecutable, filtrados por extensión y sin
    /// repetidos (se respeta el orden).
    pub fn download_set(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        let candidates = self
            .inputs
            .iter()
            .map(|f| f.name.as_str())
            .chain(std::iter::once(self.executable.as_str()));

        for name in candidates {
            if is_fetched_file(name) && !files.iter().any(|f| f == name) {
                files.push(name.to_string());
            }
        }
        files
    }

    /// Línea de comando tal como se registra en el log del job.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.executable)
    }
}

/// Una invocación concreta del pipeline para una tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInstance {
    pub handler_id: String,
    pub task_id: TaskId,
}

impl HandlerInstance {
    pub fn new(task_id: &str) -> Self {
        Self::with_id(task_id, &generate_handler_id())
    }

    pub fn with_id(task_id: &str, handler_id: &str) -> Self {
        Self {
            handler_id: handler_id.to_string(),
            task_id: task_id.to_string(),
        }
    }

    /// `task-<taskId con ':' → '__'>@<handlerId>.log`
    pub fn log_name(&self) -> String {
        format!(
            "task-{}@{}.log",
            self.task_id.replace(':', "__"),
            self.handler_id
        )
    }
}

fn generate_handler_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(HANDLER_ID_LEN);
    id
}

fn scalar_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let values: Vec<Value> = Vec::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(D::Error::custom(format!(
                "argumento no soportado: {}",
                other
            ))),
        })
        .collect()
}
