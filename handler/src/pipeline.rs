use chrono::Utc;
use std::{collections::VecDeque, sync::Arc};
use tokio::time::sleep;
use tracing::{error, info, warn};

use common::{HandlerInstance, Metrics, Resolved, Stage, StageEvent, TaskRequest};

use crate::config::HandlerConfig;
use crate::error::{HandlerError, Result};
use crate::resolver;
use crate::storage::ObjectStore;
use crate::supervisor;
use crate::tasklog::TaskLog;
use crate::transfer;

/// Una tarea en curso: el descriptor, la instancia del handler y su log.
struct TaskRun {
    request: TaskRequest,
    instance: HandlerInstance,
    log: TaskLog,
}

impl TaskRun {
    fn open(request: TaskRequest, config: &HandlerConfig) -> Result<Self> {
        let instance = HandlerInstance::new(&request.task_id);
        let log = TaskLog::create(&config.log_dir, &instance.log_name()).map_err(|source| {
            HandlerError::TaskLog {
                path: config.log_dir.join(instance.log_name()),
                source,
            }
        })?;

        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        info!(
            "handler {} para la tarea {} en {}",
            instance.handler_id, request.task_id, hostname
        );

        let env = request.env.clone().unwrap_or_else(|| serde_json::json!({}));
        log.info(format!("Environment variables (HF_LOG):{}", env));
        log.info(format!("handler started, (ID: {})", instance.handler_id));
        log.info(format!(
            "jobMessage: {}",
            serde_json::to_string(&request).unwrap_or_default()
        ));

        info!("Executable: {}", request.executable);
        info!("Arguments:  {}", request.args.join(","));
        info!("Inputs:     {}", request.input_names().join(","));
        info!("Outputs:    {}", request.output_names().join(","));
        info!("Bucket:     {}", request.options.bucket);
        info!("Prefix:     {}", request.options.prefix);
        info!("Stdout:     {}", request.stdout.as_deref().unwrap_or("-"));

        Ok(Self {
            request,
            instance,
            log,
        })
    }
}

/// Orquestador: descarga → ejecución → subida, una tarea a la vez.
pub struct Pipeline {
    config: HandlerConfig,
    store: Arc<dyn ObjectStore>,
}

impl Pipeline {
    pub fn new(config: HandlerConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    /// Procesa el argumento del proceso y todas las solicitudes que genere,
    /// en orden estricto. La siguiente tarea arranca recién cuando la
    /// anterior terminó su subida. Devuelve cuántas tareas se completaron.
    pub async fn run_queue(&self, arg: &str) -> Result<usize> {
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(arg.to_string());
        let mut completed = 0;

        while let Some(raw) = queue.pop_front() {
            match resolver::resolve(&raw, self.store.as_ref()).await? {
                Resolved::Batch(entries) => {
                    if entries.is_empty() {
                        warn!("lista de solicitudes vacía, nada que hacer");
                    }
                    // las entradas de una lista anidada van antes que el resto
                    for entry in entries.into_iter().rev() {
                        queue.push_front(entry);
                    }
                }
                Resolved::Single(request) => {
                    let metrics = self.run(*request).await?;
                    info!("Success");
                    info!("{}", metrics);
                    completed += 1;
                }
            }
        }

        Ok(completed)
    }

    /// Corre una tarea por la máquina de estados hasta `Done` o `Failed`.
    pub async fn run(&self, request: TaskRequest) -> Result<Metrics> {
        let mut metrics = Metrics::started();
        let mut stage = Stage::Resolving;

        let task = match TaskRun::open(request, &self.config) {
            Ok(task) => task,
            Err(e) => return Err(fail(stage, None, e)),
        };
        stage = stage.advance(StageEvent::Resolved)?;

        while !stage.is_terminal() {
            let outcome = match stage {
                Stage::Downloading => self.download(&task, &mut metrics).await,
                Stage::Executing => self.execute(&task, &mut metrics).await,
                Stage::Uploading => self.upload(&task, &mut metrics).await,
                Stage::Resolving | Stage::Done | Stage::Failed => break,
            };

            stage = match outcome {
                Ok(event) => stage.advance(event)?,
                Err(e) => return Err(fail(stage, Some(&task), e)),
            };
        }

        metrics.handler_end = Some(Utc::now());
        Ok(metrics)
    }

    async fn download(&self, task: &TaskRun, metrics: &mut Metrics) -> Result<StageEvent> {
        metrics.download_start = Some(Utc::now());
        transfer::download(self.store.clone(), &task.request, &self.config.work_dir).await?;
        metrics.download_end = Some(Utc::now());
        Ok(StageEvent::Downloaded)
    }

    async fn execute(&self, task: &TaskRun, metrics: &mut Metrics) -> Result<StageEvent> {
        metrics.execution_start = Some(Utc::now());
        let execution = supervisor::execute(&task.request, &self.config, &task.log).await?;
        metrics.execution_end = Some(Utc::now());

        if execution.exit_code != Some(0) {
            warn!(
                "{} terminó con código {:?}",
                task.request.executable, execution.exit_code
            );
        }
        Ok(StageEvent::Executed)
    }

    /// Subida best-effort: ningún error de esta etapa falla la tarea.
    async fn upload(&self, task: &TaskRun, metrics: &mut Metrics) -> Result<StageEvent> {
        let request = &task.request;
        let work_dir = &self.config.work_dir;
        let bucket = &request.options.bucket;

        let inputs = transfer::size_report(&request.input_names(), work_dir);
        let outputs = transfer::size_report(&request.output_names(), work_dir);
        task.log.info(format!("Job inputs: {}", inputs));
        task.log.info(format!("Job outputs: {}", outputs));

        if self.config.upload_outputs {
            for name in request.output_names() {
                let key = request.options.key_for(&name);
                match transfer::upload_file(self.store.as_ref(), bucket, &key, &work_dir.join(&name))
                    .await
                {
                    Ok(()) => task.log.info(format!("Output uploaded: {}", name)),
                    Err(e) => warn!("{}", e),
                }
            }
        }

        task.log.info("handler exiting");
        task.log.flush();
        sleep(self.config.log_flush_delay).await;

        let log_name = task.instance.log_name();
        let key = request.options.log_key(&log_name);
        metrics.upload_start = Some(Utc::now());
        match transfer::upload_file(self.store.as_ref(), bucket, &key, task.log.path()).await {
            Ok(()) => info!("log subido {}", log_name),
            Err(e) => warn!("error subiendo el log {}: {}", log_name, e),
        }

        metrics.upload_end = Some(Utc::now());
        Ok(StageEvent::Uploaded)
    }
}

fn fail(stage: Stage, task: Option<&TaskRun>, err: HandlerError) -> HandlerError {
    error!("la etapa {} falló: {}", stage, err);
    if let Some(task) = task {
        task.log.info(format!("handler failed ({}): {}", stage, err));
        task.log.flush();
    }
    if let Err(e) = stage.advance(StageEvent::Failed) {
        warn!("{}", e);
    }
    err
}
