//! Lectura de contadores de un proceso desde `/proc`.

use serde::Serialize;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// ESRCH en Linux: el proceso terminó mientras leíamos.
const ESRCH: i32 = 3;

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("el proceso {0} no existe")]
    NotFound(u32),

    #[error("error leyendo /proc: {0}")]
    Io(#[from] io::Error),

    #[error("formato inesperado en {file}: {line}")]
    Parse { file: &'static str, line: String },
}

/// Contadores de `/proc/<pid>/io`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcIo {
    pub read: u64,
    pub write: u64,
    pub read_syscalls: u64,
    pub write_syscalls: u64,
    pub read_real: u64,
    pub write_real: u64,
    pub write_cancelled: u64,
}

/// Una fila de `/proc/<pid>/net/dev`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetDevice {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_drop: u64,
    pub rx_fifo_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_compressed: u64,
    pub rx_multicast: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_drop: u64,
    pub tx_fifo_errors: u64,
    pub tx_collisions: u64,
    pub tx_carrier_errors: u64,
    pub tx_compressed: u64,
}

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file(&self, pid: u32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    pub async fn cmdline(&self, pid: u32) -> Result<Vec<String>, ProcError> {
        let raw = read(&self.file(pid, "cmdline"), pid).await?;
        Ok(parse_cmdline(&raw))
    }

    pub async fn io(&self, pid: u32) -> Result<ProcIo, ProcError> {
        let raw = read(&self.file(pid, "io"), pid).await?;
        parse_io(&String::from_utf8_lossy(&raw))
    }

    pub async fn net_dev(&self, pid: u32) -> Result<Vec<NetDevice>, ProcError> {
        let raw = read(&self.file(pid, "net/dev"), pid).await?;
        parse_net_dev(&String::from_utf8_lossy(&raw))
    }
}

async fn read(path: &Path, pid: u32) -> Result<Vec<u8>, ProcError> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(ESRCH) {
            ProcError::NotFound(pid)
        } else {
            ProcError::Io(e)
        }
    })
}

pub fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

pub fn parse_io(content: &str) -> Result<ProcIo, ProcError> {
    let mut fields: HashMap<&str, u64> = HashMap::new();

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parsed = line
            .split_once(':')
            .and_then(|(k, v)| v.trim().parse::<u64>().ok().map(|v| (k.trim(), v)));
        match parsed {
            Some((k, v)) => {
                fields.insert(k, v);
            }
            None => {
                return Err(ProcError::Parse {
                    file: "io",
                    line: line.to_string(),
                })
            }
        }
    }

    let get = |k: &str| fields.get(k).copied().unwrap_or(0);
    Ok(ProcIo {
        read: get("rchar"),
        write: get("wchar"),
        read_syscalls: get("syscr"),
        write_syscalls: get("syscw"),
        read_real: get("read_bytes"),
        write_real: get("write_bytes"),
        write_cancelled: get("cancelled_write_bytes"),
    })
}

/// Las dos primeras líneas son encabezados; luego `iface: 16 contadores`.
pub fn parse_net_dev(content: &str) -> Result<Vec<NetDevice>, ProcError> {
    let mut devices = Vec::new();

    for line in content.lines().skip(2).filter(|l| !l.trim().is_empty()) {
        let parse_err = || ProcError::Parse {
            file: "net/dev",
            line: line.to_string(),
        };

        let (name, counters) = line.split_once(':').ok_or_else(parse_err)?;
        let values: Vec<u64> = counters
            .split_whitespace()
            .map(|v| v.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| parse_err())?;
        if values.len() < 16 {
            return Err(parse_err());
        }

        devices.push(NetDevice {
            name: name.trim().to_string(),
            rx_bytes: values[0],
            rx_packets: values[1],
            rx_errors: values[2],
            rx_drop: values[3],
            rx_fifo_errors: values[4],
            rx_frame_errors: values[5],
            rx_compressed: values[6],
            rx_multicast: values[7],
            tx_bytes: values[8],
            tx_packets: values[9],
            tx_errors: values[10],
            tx_drop: values[11],
            tx_fifo_errors: values[12],
            tx_collisions: values[13],
            tx_carrier_errors: values[14],
            tx_compressed: values[15],
        });
    }

    Ok(devices)
}
