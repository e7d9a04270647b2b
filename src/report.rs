//! Outcome report of a synchronization in text, JSON or CSV.

use serde::Serialize;

use crate::{
    estimator::EstimatorMode,
    session::{Role, Session, SessionState},
    sync::SyncOutcome,
    time::wall_clock_now,
};

/// Output format for the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
    /// CSV output for spreadsheet import.
    Csv,
}

/// Serializable summary of one side of a synchronization.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub role: Role,
    pub state: SessionState,
    pub latency_ms: Option<f64>,
    /// True if this side computed the latency, false if it received it.
    pub computed_locally: Option<bool>,
    pub probes_sent: u32,
    pub samples: usize,
    pub estimator: Option<EstimatorMode>,
    pub median_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub std_dev_ms: Option<f64>,
    pub kept_samples: Option<usize>,
    pub completed_at: String,
}

impl SyncReport {
    pub fn new(role: Role, outcome: &SyncOutcome, session: &Session) -> Self {
        let estimate = session.estimate();
        SyncReport {
            role,
            state: session.state(),
            latency_ms: outcome.latency(),
            computed_locally: match *outcome {
                SyncOutcome::Done { initiator, .. } => Some(initiator),
                _ => None,
            },
            probes_sent: session.probes_sent(),
            samples: session.samples().len(),
            estimator: estimate.map(|e| e.mode),
            median_ms: estimate.map(|e| e.median),
            mean_ms: estimate.map(|e| e.mean),
            std_dev_ms: estimate.map(|e| e.std_dev),
            kept_samples: estimate.map(|e| e.kept.len()),
            completed_at: wall_clock_now(),
        }
    }

    /// Prints the report in the given format.
    pub fn print(&self, format: OutputFormat) {
        println!("{}", self.render(format));
    }

    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
            OutputFormat::Csv => self.render_csv(),
        }
    }

    fn render_text(&self) -> String {
        let mut lines = vec![
            "--- Time Sync Report ---".to_string(),
            format!("Role: {}", self.role),
            format!("State: {:?}", self.state),
        ];
        match (self.latency_ms, self.computed_locally) {
            (Some(latency), Some(true)) => {
                lines.push(format!("Latency: {:.3} ms (computed)", latency))
            }
            (Some(latency), _) => lines.push(format!("Latency: {:.3} ms (from peer)", latency)),
            (None, _) => lines.push("Latency: unavailable".to_string()),
        }
        if self.role.is_initiator() {
            lines.push(format!("Probes sent: {}", self.probes_sent));
            lines.push(format!("Samples: {}", self.samples));
        }
        if let Some(v) = self.median_ms {
            lines.push(format!("Median: {:.3} ms", v));
        }
        if let Some(v) = self.mean_ms {
            lines.push(format!("Mean: {:.3} ms", v));
        }
        if let Some(v) = self.std_dev_ms {
            lines.push(format!("Std Dev: {:.3} ms", v));
        }
        if let Some(kept) = self.kept_samples {
            lines.push(format!("Kept samples: {}/{}", kept, self.samples));
        }
        lines.push(format!("Completed at: {}", self.completed_at));
        lines.join("\n")
    }

    fn render_json(&self) -> String {
        // Non-finite floats become null.
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::warn!("cannot serialize report: {}", e);
            String::from("{}")
        })
    }

    fn render_csv(&self) -> String {
        let header = "role,state,latency_ms,computed_locally,probes_sent,samples,\
                      median_ms,mean_ms,std_dev_ms,kept_samples,completed_at";
        let row = format!(
            "{},{:?},{},{},{},{},{},{},{},{},{}",
            self.role,
            self.state,
            fmt_opt(self.latency_ms),
            self.computed_locally.map_or_else(String::new, |b| b.to_string()),
            self.probes_sent,
            self.samples,
            fmt_opt(self.median_ms),
            fmt_opt(self.mean_ms),
            fmt_opt(self.std_dev_ms),
            self.kept_samples.map_or_else(String::new, |k| k.to_string()),
            self.completed_at,
        );
        format!("{}\n{}", header, row)
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(String::new, |x| format!("{:.3}", x))
}
