use anyhow::{bail, Context, Result};
use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_WORK_DIR: &str = "/mnt/data";
pub const DEFAULT_LOG_DIR: &str = "/mnt/data/logs-hf";
pub const DEFAULT_STORAGE_URL: &str = "https://s3.us-east-1.amazonaws.com";
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_LOG_FLUSH_DELAY_MS: u64 = 200;

/// Configuración del handler. Se lee una vez al arrancar y se pasa a cada
/// etapa; nada depende del directorio actual del proceso.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Directorio de staging: destino de descargas y cwd del proceso hijo.
    pub work_dir: PathBuf,
    /// Directorio local de los logs por tarea.
    pub log_dir: PathBuf,
    /// Endpoint del storage (`http(s)://...` o `file://<dir>`).
    pub storage_url: String,
    /// Período de muestreo de la telemetría.
    pub poll_interval: Duration,
    /// Espera antes de releer el log para subirlo.
    pub log_flush_delay: Duration,
    pub node_bin: String,
    pub java_bin: String,
    pub shell: String,
    /// Sin valor no hay timeout: un hijo colgado cuelga la tarea.
    pub exec_timeout: Option<Duration>,
    pub upload_outputs: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            storage_url: DEFAULT_STORAGE_URL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            log_flush_delay: Duration::from_millis(DEFAULT_LOG_FLUSH_DELAY_MS),
            node_bin: "node".to_string(),
            java_bin: "java".to_string(),
            shell: "/bin/sh".to_string(),
            exec_timeout: None,
            upload_outputs: false,
        }
    }
}

impl HandlerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let poll_ms = parse_u64(&get, "HF_POLL_INTERVAL_MS")?.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_ms == 0 {
            bail!("HF_POLL_INTERVAL_MS debe ser mayor que 0");
        }
        let flush_ms =
            parse_u64(&get, "HF_LOG_FLUSH_DELAY_MS")?.unwrap_or(DEFAULT_LOG_FLUSH_DELAY_MS);

        let upload_outputs = match get("HF_UPLOAD_OUTPUTS") {
            Some(v) => parse_bool(&v)
                .with_context(|| format!("HF_UPLOAD_OUTPUTS inválido: {}", v))?,
            None => defaults.upload_outputs,
        };

        Ok(Self {
            work_dir: get("HF_WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            log_dir: get("HF_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            storage_url: get("HF_STORAGE_URL").unwrap_or(defaults.storage_url),
            poll_interval: Duration::from_millis(poll_ms),
            log_flush_delay: Duration::from_millis(flush_ms),
            node_bin: get("HF_NODE_BIN").unwrap_or(defaults.node_bin),
            java_bin: get("HF_JAVA_BIN").unwrap_or(defaults.java_bin),
            shell: get("HF_SHELL").unwrap_or(defaults.shell),
            exec_timeout: parse_u64(&get, "HF_EXEC_TIMEOUT_SECS")?.map(Duration::from_secs),
            upload_outputs,
        })
    }
}

fn parse_u64<G>(get: &G, key: &str) -> Result<Option<u64>>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{} inválido: {}", key, v)),
        None => Ok(None),
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("se esperaba un booleano, llegó '{}'", other),
    }
}
