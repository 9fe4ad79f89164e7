use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::procfs::{ProcError, ProcFs, ProcIo};
use crate::tasklog::TaskLog;

/// Cómo se identifica al job en las muestras.
#[derive(Debug, Clone)]
pub struct JobLabel {
    pub executable: String,
    pub name: Option<String>,
}

#[derive(Serialize)]
struct CommandSample<'a> {
    pid: u32,
    name: &'a str,
    command: Vec<String>,
}

#[derive(Serialize)]
struct IoSample<'a> {
    #[serde(flatten)]
    io: ProcIo,
    pid: u32,
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageSample {
    /// % de CPU desde la muestra anterior
    cpu: f32,
    /// bytes residentes
    memory: u64,
    virtual_memory: u64,
    ppid: Option<u32>,
    pid: u32,
    /// ms desde que arrancó el proceso
    elapsed: u64,
    timestamp: i64,
}

/// Muestreo periódico de un proceso hijo.
///
/// Tres loops independientes (IO, red, uso de CPU/memoria) que corren
/// hasta que el supervisor llama a `stop`, o hasta que una muestra falla
/// porque el proceso ya no existe.
pub struct Telemetry {
    stop: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Telemetry {
    pub async fn start(pid: u32, label: JobLabel, log: TaskLog, period: Duration) -> Self {
        Self::start_with(ProcFs::default(), pid, label, log, period).await
    }

    pub async fn start_with(
        proc: ProcFs,
        pid: u32,
        label: JobLabel,
        log: TaskLog,
        period: Duration,
    ) -> Self {
        log_command(&proc, pid, &label, &log).await;

        let (stop, stop_rx) = watch::channel(false);
        let loops = vec![
            tokio::spawn(sample_io(
                proc.clone(),
                pid,
                label.name.clone(),
                log.clone(),
                Ticker::new(period, stop_rx.clone()),
            )),
            tokio::spawn(sample_net_dev(
                proc,
                pid,
                log.clone(),
                Ticker::new(period, stop_rx.clone()),
            )),
            tokio::spawn(sample_usage(pid, log, Ticker::new(period, stop_rx))),
        ];

        Self { stop, loops }
    }

    /// Corta los loops y espera a que terminen.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!("loop de telemetría terminó con error: {}", e);
            }
        }
    }
}

struct Ticker {
    interval: Interval,
    stop: watch::Receiver<bool>,
}

impl Ticker {
    fn new(period: Duration, stop: watch::Receiver<bool>) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, stop }
    }

    /// `false` cuando hay que dejar de muestrear.
    async fn next(&mut self) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        let ticked = tokio::select! {
            _ = self.interval.tick() => true,
            _ = self.stop.changed() => false,
        };
        ticked && !*self.stop.borrow()
    }
}

async fn log_command(proc: &ProcFs, pid: u32, label: &JobLabel, log: &TaskLog) {
    match proc.cmdline(pid).await {
        Ok(command) => {
            let sample = CommandSample {
                pid,
                name: &label.executable,
                command,
            };
            log.info(format!("command: {}", to_json(&sample)));
        }
        Err(ProcError::NotFound(_)) => {
            warn!("el proceso {} no existe", pid);
        }
        Err(e) => warn!("no se pudo leer la línea de comando de {}: {}", pid, e),
    }
}

async fn sample_io(proc: ProcFs, pid: u32, name: Option<String>, log: TaskLog, mut ticker: Ticker) {
    while ticker.next().await {
        match proc.io(pid).await {
            Ok(io) => {
                let sample = IoSample {
                    io,
                    pid,
                    name: name.as_deref(),
                };
                log.info(format!("IO: {}", to_json(&sample)));
            }
            Err(e) => {
                sample_ended("IO", pid, &e);
                break;
            }
        }
    }
}

async fn sample_net_dev(proc: ProcFs, pid: u32, log: TaskLog, mut ticker: Ticker) {
    while ticker.next().await {
        match proc.net_dev(pid).await {
            Ok(devices) => log.info(format!("NetDev: pid: {} {}", pid, to_json(&devices))),
            Err(e) => {
                sample_ended("NetDev", pid, &e);
                break;
            }
        }
    }
}

async fn sample_usage(pid: u32, log: TaskLog, mut ticker: Ticker) {
    let mut sys = System::new();
    while ticker.next().await {
        match usage(&mut sys, pid) {
            Some(sample) => log.info(format!("Procusage: pid: {} {}", pid, to_json(&sample))),
            None => {
                sample_ended("Procusage", pid, &ProcError::NotFound(pid));
                break;
            }
        }
    }
}

fn usage(sys: &mut System, pid: u32) -> Option<UsageSample> {
    let spid = Pid::from_u32(pid);
    if !sys.refresh_process(spid) {
        return None;
    }
    let process = sys.process(spid)?;

    Some(UsageSample {
        cpu: process.cpu_usage(),
        memory: process.memory(),
        virtual_memory: process.virtual_memory(),
        ppid: process.parent().map(|p| p.as_u32()),
        pid,
        elapsed: process.run_time() * 1000,
        timestamp: Utc::now().timestamp_millis(),
    })
}

fn sample_ended(what: &str, pid: u32, err: &ProcError) {
    match err {
        ProcError::NotFound(_) => {
            debug!("el proceso {} no existe, fin del muestreo {} (esto es normal)", pid, what)
        }
        other => warn!("muestreo {} del proceso {} falló: {}", what, pid, other),
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_proc(root: &std::path::Path, pid: u32) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(dir.join("net")).unwrap();
        fs::write(dir.join("cmdline"), b"/bin/sh\0-c\0run.sh x\0").unwrap();
        fs::write(dir.join("io"), "rchar: 10\nwchar: 20\n").unwrap();
        fs::write(
            dir.join("net/dev"),
            "h1\nh2\n  eth0: 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16\n",
        )
        .unwrap();
    }

    fn label() -> JobLabel {
        JobLabel {
            executable: "run.sh".into(),
            name: Some("job".into()),
        }
    }

    #[tokio::test]
    async fn registra_comando_y_muestras_hasta_stop() {
        let tmp = tempfile::tempdir().unwrap();
        // pid que no corresponde a ningún proceso real: sysinfo termina su loop solo
        let pid = 999_999;
        fake_proc(tmp.path(), pid);
        let log = TaskLog::create(&tmp.path().join("logs"), "t.log").unwrap();

        let telemetry = Telemetry::start_with(
            ProcFs::new(tmp.path()),
            pid,
            label(),
            log.clone(),
            Duration::from_millis(10),
        )
        .await;
        time::sleep(Duration::from_millis(60)).await;
        telemetry.stop().await;

        let content = fs::read_to_string(log.path()).unwrap();
        assert!(content.contains(r#"command: {"pid":999999,"name":"run.sh","command":["/bin/sh","-c","run.sh x"]}"#));
        assert!(content.contains(r#"IO: {"read":10,"write":20"#));
        assert!(content.contains(r#""name":"job""#));
        assert!(content.contains("NetDev: pid: 999999 [{\"name\":\"eth0\""));
        assert!(!content.contains("Procusage"));
    }

    #[tokio::test]
    async fn no_registra_mas_muestras_despues_de_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let pid = 999_998;
        fake_proc(tmp.path(), pid);
        let log = TaskLog::create(&tmp.path().join("logs"), "t.log").unwrap();

        let telemetry = Telemetry::start_with(
            ProcFs::new(tmp.path()),
            pid,
            label(),
            log.clone(),
            Duration::from_millis(10),
        )
        .await;
        telemetry.stop().await;

        let before = fs::read_to_string(log.path()).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        let after = fs::read_to_string(log.path()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn proceso_inexistente_no_es_error() {
        let tmp = tempfile::tempdir().unwrap();
        let log = TaskLog::create(tmp.path(), "t.log").unwrap();

        let telemetry = Telemetry::start_with(
            ProcFs::new(tmp.path()),
            424_242,
            label(),
            log.clone(),
            Duration::from_millis(10),
        )
        .await;
        // los tres loops terminan solos; stop no debe colgarse
        time::sleep(Duration::from_millis(30)).await;
        telemetry.stop().await;

        let content = fs::read_to_string(log.path()).unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn muestra_uso_del_proceso_actual() {
        let mut sys = System::new();
        let sample = usage(&mut sys, std::process::id()).expect("el proceso de test existe");
        assert_eq!(sample.pid, std::process::id());
        assert!(sample.memory > 0);
    }
}
