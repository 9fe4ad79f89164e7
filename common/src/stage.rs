use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Estados del pipeline de una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Resolving,
    Downloading,
    Executing,
    Uploading,
    Done,
    Failed,
}

/// Eventos que hacen avanzar el pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    Resolved,
    Downloaded,
    Executed,
    Uploaded,
    Failed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transición inválida: {event:?} en estado {from}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub event: StageEvent,
}

impl Stage {
    /// Única función de transición del pipeline.
    pub fn advance(self, event: StageEvent) -> Result<Stage, InvalidTransition> {
        use Stage::*;

        let next = match (self, event) {
            (Resolving, StageEvent::Resolved) => Downloading,
            (Downloading, StageEvent::Downloaded) => Executing,
            (Executing, StageEvent::Executed) => Uploading,
            (Uploading, StageEvent::Uploaded) => Done,
            (from, StageEvent::Failed) if !from.is_terminal() => Failed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Resolving => "resolving",
            Stage::Downloading => "downloading",
            Stage::Executing => "executing",
            Stage::Uploading => "uploading",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camino_feliz_en_orden() {
        let mut stage = Stage::Resolving;
        for ev in [
            StageEvent::Resolved,
            StageEvent::Downloaded,
            StageEvent::Executed,
            StageEvent::Uploaded,
        ] {
            assert!(!stage.is_terminal());
            stage = stage.advance(ev).unwrap();
        }
        assert_eq!(stage, Stage::Done);
        assert!(stage.is_terminal());
    }

    #[test]
    fn cualquier_etapa_activa_puede_fallar() {
        for s in [
            Stage::Resolving,
            Stage::Downloading,
            Stage::Executing,
            Stage::Uploading,
        ] {
            assert_eq!(s.advance(StageEvent::Failed).unwrap(), Stage::Failed);
        }
    }

    #[test]
    fn no_se_saltan_etapas() {
        let err = Stage::Downloading.advance(StageEvent::Executed).unwrap_err();
        assert_eq!(err.from, Stage::Downloading);
        assert_eq!(err.event, StageEvent::Executed);

        assert!(Stage::Resolving.advance(StageEvent::Uploaded).is_err());
    }

    #[test]
    fn estados_terminales_no_avanzan() {
        assert!(Stage::Done.advance(StageEvent::Failed).is_err());
        assert!(Stage::Failed.advance(StageEvent::Resolved).is_err());
    }
}
