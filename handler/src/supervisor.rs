use std::{
    os::unix::fs::PermissionsExt,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    task::{AbortHandle, JoinHandle},
    time::{self, Instant},
};
use tracing::{error, info, warn};

use common::{ExecutableKind, TaskRequest};

use crate::config::HandlerConfig;
use crate::error::{HandlerError, Result};
use crate::tasklog::TaskLog;
use crate::telemetry::{JobLabel, Telemetry};

/// Lo que queda de la ejecución una vez que el hijo terminó y cerró sus pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub pid: Option<u32>,
    /// `None` si el hijo murió por una señal.
    pub exit_code: Option<i32>,
}

/// Ejecuta el programa de la tarea dentro del directorio de staging.
///
/// - `.js`  → runtime de scripts (`HF_NODE_BIN`) con el script y sus args
/// - `.jar` → `java -jar <jar> <args>`
/// - resto  → `sh -c "<ejecutable> <args>"`
///
/// stdout/stderr se vuelcan línea a línea a la consola; si la tarea declara
/// `stdout`, la salida estándar se copia además a ese archivo. La etapa
/// termina cuando el hijo terminó y sus pipes se cerraron.
pub async fn execute(request: &TaskRequest, config: &HandlerConfig, log: &TaskLog) -> Result<Execution> {
    let kind = request.kind();
    let work_dir = config.work_dir.as_path();

    if kind.is_fetched() {
        make_executable(&work_dir.join(&request.executable)).await?;
    }

    // se abre antes de lanzar para no dejar un hijo huérfano si falla
    let stdout_sink = match &request.stdout {
        Some(name) => {
            let path = work_dir.join(name);
            let file = File::create(&path)
                .await
                .map_err(|source| HandlerError::StageFile { path, source })?;
            Some(file)
        }
        None => None,
    };

    info!("lanzando ejecutable {}", request.executable);
    log.info(format!("Job command: '{}'", request.command_line()));

    let mut child = build_command(kind, request, config)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            error!("error lanzando {}: {}", request.executable, source);
            HandlerError::Spawn {
                executable: request.executable.clone(),
                source,
            }
        })?;

    let pid = child.id();
    let telemetry = match pid {
        Some(pid) => Some(
            Telemetry::start(
                pid,
                JobLabel {
                    executable: request.executable.clone(),
                    name: request.name.clone(),
                },
                log.clone(),
                config.poll_interval,
            )
            .await,
        ),
        None => None,
    };
    log.info(format!("job started: {}", request.display_name()));

    let pumps: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, "Stdout", request.executable.clone(), stdout_sink))),
        child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, "Stderr", request.executable.clone(), None))),
    ]
    .into_iter()
    .flatten()
    .collect();

    // el mismo límite cubre la espera del hijo y el drenado de sus pipes
    let deadline = config.exec_timeout.map(|limit| Deadline {
        at: Instant::now() + limit,
        limit,
    });

    let finished = match wait(&mut child, deadline, &request.executable).await {
        Ok(status) => {
            info!("el ejecutable {} terminó ({})", request.executable, status);
            drain(pumps, deadline, &request.executable)
                .await
                .map(|()| status)
        }
        Err(e) => {
            pumps.iter().for_each(JoinHandle::abort);
            Err(e)
        }
    };

    // pase lo que pase los loops de muestreo no sobreviven al hijo
    if let Some(t) = telemetry {
        t.stop().await;
    }
    let status = finished?;

    info!("el ejecutable {} cerró sus salidas", request.executable);
    log.info(format!("job successful (try 1): {}", request.display_name()));

    let exit_code = status.code();
    log.info(format!(
        "job exit code: {}",
        exit_code.map(|c| c.to_string()).unwrap_or_else(|| "null".to_string())
    ));

    Ok(Execution { pid, exit_code })
}

async fn make_executable(path: &Path) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
        .await
        .map_err(|source| HandlerError::Permissions {
            path: path.to_path_buf(),
            source,
        })
}

fn build_command(kind: ExecutableKind, request: &TaskRequest, config: &HandlerConfig) -> Command {
    match kind {
        ExecutableKind::Script => {
            let mut cmd = Command::new(&config.node_bin);
            cmd.arg(&request.executable).args(&request.args);
            cmd
        }
        ExecutableKind::Archive => {
            let mut cmd = Command::new(&config.java_bin);
            cmd.arg("-jar").arg(&request.executable).args(&request.args);
            cmd
        }
        ExecutableKind::Shell | ExecutableKind::Native => {
            let mut cmd = Command::new(&config.shell);
            cmd.arg("-c").arg(shell_line(kind, request));
            cmd
        }
    }
}

/// Los `.sh` se bajaron al staging, así que se invocan con ruta relativa.
fn shell_line(kind: ExecutableKind, request: &TaskRequest) -> String {
    let exe = &request.executable;
    let program = if kind == ExecutableKind::Shell && !exe.starts_with('/') && !exe.starts_with("./") {
        format!("./{}", exe)
    } else {
        exe.clone()
    };

    if request.args.is_empty() {
        program
    } else {
        format!("{} {}", program, request.args.join(" "))
    }
}

/// Límite de ejecución ya convertido en un instante absoluto.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn expired(self, executable: &str) -> HandlerError {
        HandlerError::Timeout {
            executable: executable.to_string(),
            limit: self.limit,
        }
    }
}

async fn wait(child: &mut Child, deadline: Option<Deadline>, executable: &str) -> Result<ExitStatus> {
    let waited = match deadline {
        Some(deadline) => match time::timeout_at(deadline.at, child.wait()).await {
            Ok(res) => res,
            Err(_) => {
                error!(
                    "{} superó el timeout de {:?}, matando el proceso",
                    executable, deadline.limit
                );
                if let Err(e) = child.start_kill() {
                    warn!("no se pudo matar {}: {}", executable, e);
                }
                let _ = child.wait().await;
                return Err(deadline.expired(executable));
            }
        },
        None => child.wait().await,
    };

    waited.map_err(|source| HandlerError::Spawn {
        executable: executable.to_string(),
        source,
    })
}

/// Espera a que los pipes del hijo se cierren. Un nieto que hereda stdout
/// puede mantenerlos abiertos: al vencer el límite se cortan los pumps.
async fn drain(pumps: Vec<JoinHandle<()>>, deadline: Option<Deadline>, executable: &str) -> Result<()> {
    let aborts: Vec<AbortHandle> = pumps.iter().map(JoinHandle::abort_handle).collect();
    let joined = async {
        for handle in pumps {
            handle.await?;
        }
        Ok::<(), HandlerError>(())
    };

    match deadline {
        Some(deadline) => match time::timeout_at(deadline.at, joined).await {
            Ok(res) => res,
            Err(_) => {
                error!(
                    "{} dejó sus salidas abiertas más allá de {:?}",
                    executable, deadline.limit
                );
                aborts.iter().for_each(AbortHandle::abort);
                Err(deadline.expired(executable))
            }
        },
        None => joined.await,
    }
}

/// Vuelca un pipe del hijo a la consola por líneas y, si hay `sink`, copia
/// los bytes tal cual.
async fn pump<R>(mut reader: R, label: &'static str, executable: String, mut sink: Option<File>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("error leyendo {} de {}: {}", label, executable, e);
                break;
            }
        };

        if let Some(file) = sink.as_mut() {
            if let Err(e) = file.write_all(&buf[..n]).await {
                // seguimos drenando el pipe para no bloquear al hijo
                warn!("no se pudo copiar {} de {}: {}", label, executable, e);
                sink = None;
            }
        }

        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            info!("{}: {} {}", label, executable, String::from_utf8_lossy(&line).trim_end());
        }
    }

    if !pending.is_empty() {
        info!("{}: {} {}", label, executable, String::from_utf8_lossy(&pending));
    }

    if let Some(mut file) = sink {
        if let Err(e) = file.flush().await {
            warn!("no se pudo cerrar la copia de {} de {}: {}", label, executable, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{fs as stdfs, time::Duration};

    fn request(executable: &str, args: &[&str], stdout: Option<&str>) -> TaskRequest {
        let mut raw = json!({
            "executable": executable,
            "args": args,
            "options": {"bucket": "b", "prefix": "p"},
            "taskId": "t1"
        });
        if let Some(s) = stdout {
            raw["stdout"] = json!(s);
        }
        serde_json::from_value(raw).unwrap()
    }

    fn setup() -> (tempfile::TempDir, HandlerConfig, TaskLog) {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("data");
        stdfs::create_dir_all(&work).unwrap();
        let config = HandlerConfig {
            work_dir: work,
            log_dir: tmp.path().join("logs"),
            poll_interval: Duration::from_millis(20),
            ..HandlerConfig::default()
        };
        let log = TaskLog::create(&config.log_dir, "task.log").unwrap();
        (tmp, config, log)
    }

    #[tokio::test]
    async fn script_de_shell_con_stdout_a_archivo() {
        let (_tmp, config, log) = setup();
        stdfs::write(
            config.work_dir.join("run.sh"),
            "#!/bin/sh\nprintf 'uno\\ndos %s' \"$1\"\necho error >&2\n",
        )
        .unwrap();

        let req = request("run.sh", &["x"], Some("out.txt"));
        let exec = execute(&req, &config, &log).await.unwrap();

        assert_eq!(exec.exit_code, Some(0));
        assert!(exec.pid.is_some());
        // solo stdout, byte a byte, sin la salida de error
        assert_eq!(
            stdfs::read_to_string(config.work_dir.join("out.txt")).unwrap(),
            "uno\ndos x"
        );

        let mode = stdfs::metadata(config.work_dir.join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o777);

        let content = stdfs::read_to_string(log.path()).unwrap();
        assert!(content.contains("Job command: 'run.sh x'"));
        assert!(content.contains("job started: run.sh"));
        assert!(content.contains("job exit code: 0"));
    }

    #[tokio::test]
    async fn comando_nativo_corre_en_el_staging() {
        let (_tmp, config, log) = setup();
        let req = request("pwd", &[], Some("where.txt"));

        execute(&req, &config, &log).await.unwrap();

        let printed = stdfs::read_to_string(config.work_dir.join("where.txt")).unwrap();
        assert_eq!(
            Path::new(printed.trim()).canonicalize().unwrap(),
            config.work_dir.canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn codigo_de_salida_distinto_de_cero_no_es_error() {
        let (_tmp, config, log) = setup();
        let req = request("exit", &["3"], None);

        let exec = execute(&req, &config, &log).await.unwrap();
        assert_eq!(exec.exit_code, Some(3));
        assert!(stdfs::read_to_string(log.path()).unwrap().contains("job exit code: 3"));
    }

    #[tokio::test]
    async fn error_al_lanzar_falla_la_etapa() {
        let (_tmp, mut config, log) = setup();
        config.java_bin = "/no/existe/java".into();
        let req = request("tool.jar", &[], None);

        let err = execute(&req, &config, &log).await.unwrap_err();
        assert!(matches!(err, HandlerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn script_faltante_no_puede_recibir_permisos() {
        let (_tmp, config, log) = setup();
        let req = request("nada.sh", &[], None);

        let err = execute(&req, &config, &log).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permissions { .. }));
    }

    #[tokio::test]
    async fn timeout_mata_al_hijo() {
        let (_tmp, mut config, log) = setup();
        config.exec_timeout = Some(Duration::from_millis(200));
        let req = request("sleep", &["5"], None);

        let started = std::time::Instant::now();
        let err = execute(&req, &config, &log).await.unwrap_err();
        assert!(matches!(err, HandlerError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_cubre_pipes_heredados_por_un_nieto() {
        let (_tmp, mut config, log) = setup();
        config.exec_timeout = Some(Duration::from_millis(300));
        // el shell sale enseguida pero `sleep` se queda con stdout/stderr
        let req = request("sleep", &["3", "&"], None);

        let started = std::time::Instant::now();
        let err = execute(&req, &config, &log).await.unwrap_err();

        assert!(matches!(err, HandlerError::Timeout { limit, .. } if limit == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!stdfs::read_to_string(log.path()).unwrap().contains("job exit code"));
    }

    /// Runtime falso: imprime un argumento por línea.
    fn fake_runtime(dir: &Path) -> String {
        let path = dir.join("runtime.sh");
        stdfs::write(&path, "#!/bin/sh\nprintf '%s\\n' \"$@\"\n").unwrap();
        stdfs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn script_js_va_al_runtime_con_sus_argumentos() {
        let (tmp, mut config, log) = setup();
        config.node_bin = fake_runtime(tmp.path());
        stdfs::write(config.work_dir.join("main.js"), "console.log(1)").unwrap();

        let req = request("main.js", &["a", "b c"], Some("argv.txt"));
        let exec = execute(&req, &config, &log).await.unwrap();

        assert_eq!(exec.exit_code, Some(0));
        assert_eq!(
            stdfs::read_to_string(config.work_dir.join("argv.txt")).unwrap(),
            "main.js\na\nb c\n"
        );
        let mode = stdfs::metadata(config.work_dir.join("main.js"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[tokio::test]
    async fn jar_se_lanza_con_java_jar() {
        let (tmp, mut config, log) = setup();
        config.java_bin = fake_runtime(tmp.path());

        let req = request("tool.jar", &["1", "dos"], Some("argv.txt"));
        let exec = execute(&req, &config, &log).await.unwrap();

        assert_eq!(exec.exit_code, Some(0));
        assert_eq!(
            stdfs::read_to_string(config.work_dir.join("argv.txt")).unwrap(),
            "-jar\ntool.jar\n1\ndos\n"
        );
        // los .jar no se bajan ni se les cambian permisos
        assert!(!config.work_dir.join("tool.jar").exists());
    }

    #[test]
    fn linea_de_shell() {
        let sh = request("run.sh", &["a", "b"], None);
        assert_eq!(shell_line(ExecutableKind::Shell, &sh), "./run.sh a b");

        let abs = request("/opt/bin/run.sh", &[], None);
        assert_eq!(shell_line(ExecutableKind::Shell, &abs), "/opt/bin/run.sh");

        let native = request("mProject", &["in.fits", "out.fits"], None);
        assert_eq!(shell_line(ExecutableKind::Native, &native), "mProject in.fits out.fits");
    }
}
