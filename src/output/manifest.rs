//! The machine-readable job manifest.

use serde::{Deserialize, Serialize};

use crate::ocr::EngineKind;

/// Final status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Partial,
    Failed,
}

/// One extracted problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemEntry {
    pub number: u32,
    /// Path of the image file, relative to the job's output root.
    pub file: String,
    pub source: EngineKind,
}

/// One column's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub column: usize,
    pub problems: Vec<ProblemEntry>,
    /// Expected numbers that were never recovered, ascending.
    pub missing: Vec<u32>,
}

/// One page's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageEntry {
    pub page: usize,
    pub columns: Vec<ColumnEntry>,
}

/// A non-fatal or fatal error recorded for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
}

/// The manifest written to `manifest.json` at the output root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: String,
    pub pages: Vec<PageEntry>,
    pub status: JobStatus,
    pub errors: Vec<ErrorEntry>,
}

impl Manifest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text summary written next to the manifest.
    pub fn summary_report(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "Problem extraction report: {}", self.job_id);
        let _ = writeln!(out, "Status: {:?}", self.status);
        for page in &self.pages {
            for column in &page.columns {
                let _ = writeln!(
                    out,
                    "page {} column {}: {} problem(s){}",
                    page.page,
                    column.column,
                    column.problems.len(),
                    if column.missing.is_empty() {
                        String::new()
                    } else {
                        format!(", missing {:?}", column.missing)
                    }
                );
                for problem in &column.problems {
                    let _ = writeln!(
                        out,
                        "  {:>3}  {}  ({})",
                        problem.number, problem.file, problem.source
                    );
                }
            }
        }
        for error in &self.errors {
            let _ = writeln!(out, "error [{}]: {}", error.kind, error.message);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            job_id: "sample".to_string(),
            pages: vec![PageEntry {
                page: 0,
                columns: vec![ColumnEntry {
                    column: 0,
                    problems: vec![ProblemEntry {
                        number: 1,
                        file: "page_0/problems/page0_col_0_prob_01.png".to_string(),
                        source: EngineKind::Local,
                    }],
                    missing: vec![2],
                }],
            }],
            status: JobStatus::Partial,
            errors: vec![ErrorEntry {
                kind: "remote_unavailable".to_string(),
                message: "credentials not configured".to_string(),
            }],
        }
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["status"], "partial");
        assert_eq!(value["pages"][0]["page"], 0);
        let problem = &value["pages"][0]["columns"][0]["problems"][0];
        assert_eq!(problem["number"], 1);
        assert_eq!(problem["source"], "local");
        assert_eq!(value["pages"][0]["columns"][0]["missing"][0], 2);
        assert_eq!(value["errors"][0]["kind"], "remote_unavailable");
    }

    #[test]
    fn round_trips_through_json() {
        let json = sample().to_json().unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, JobStatus::Partial);
        assert_eq!(back.pages[0].columns[0].problems[0].number, 1);
    }

    #[test]
    fn report_mentions_missing_numbers() {
        let report = sample().summary_report();
        assert!(report.contains("missing [2]"));
        assert!(report.contains("remote_unavailable"));
    }
}
