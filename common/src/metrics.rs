use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marcas de tiempo de una ejecución del pipeline.
/// Vive mientras corre la tarea y se descarta después de loguearla.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub handler_start: Option<DateTime<Utc>>,
    pub handler_end: Option<DateTime<Utc>>,
    pub download_start: Option<DateTime<Utc>>,
    pub download_end: Option<DateTime<Utc>>,
    pub execution_start: Option<DateTime<Utc>>,
    pub execution_end: Option<DateTime<Utc>>,
    pub upload_start: Option<DateTime<Utc>>,
    pub upload_end: Option<DateTime<Utc>>,
}

impl Metrics {
    pub fn started() -> Self {
        Self {
            handler_start: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Devuelve `true` si las etapas registradas están en orden
    /// (cada fin >= su inicio y cada etapa empieza después de la anterior).
    pub fn is_ordered(&self) -> bool {
        let marks = [
            self.handler_start,
            self.download_start,
            self.download_end,
            self.execution_start,
            self.execution_end,
            self.upload_start,
            self.upload_end,
            self.handler_end,
        ];
        let present: Vec<DateTime<Utc>> = marks.iter().flatten().copied().collect();
        present.windows(2).all(|w| w[0] <= w[1])
    }
}

fn millis(ts: &Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.timestamp_millis().to_string())
        .unwrap_or_default()
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler start: {} handler end: {} download start: {} download end: {} \
             execution start: {} execution end: {} upload start: {} upload end: {}",
            millis(&self.handler_start),
            millis(&self.handler_end),
            millis(&self.download_start),
            millis(&self.download_end),
            millis(&self.execution_start),
            millis(&self.execution_end),
            millis(&self.upload_start),
            millis(&self.upload_end),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms).single()
    }

    #[test]
    fn linea_con_las_ocho_marcas() {
        let m = Metrics {
            handler_start: at(1),
            handler_end: at(8),
            download_start: at(2),
            download_end: at(3),
            execution_start: at(4),
            execution_end: at(5),
            upload_start: at(6),
            upload_end: at(7),
        };
        assert_eq!(
            m.to_string(),
            "handler start: 1 handler end: 8 download start: 2 download end: 3 \
             execution start: 4 execution end: 5 upload start: 6 upload end: 7"
        );
        assert!(m.is_ordered());
    }

    #[test]
    fn marcas_faltantes_quedan_vacias() {
        let m = Metrics {
            handler_start: at(10),
            ..Metrics::default()
        };
        assert!(m.to_string().starts_with("handler start: 10 handler end:  download"));
    }

    #[test]
    fn detecta_etapas_fuera_de_orden() {
        let m = Metrics {
            download_start: at(5),
            download_end: at(3),
            ..Metrics::default()
        };
        assert!(!m.is_ordered());
    }

    #[test]
    fn started_marca_el_inicio() {
        let m = Metrics::started();
        assert!(m.handler_start.is_some());
        assert!(m.download_start.is_none());
    }
}
