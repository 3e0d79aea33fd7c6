use chrono::{DateTime, Utc};
use serde::Serialize;

/// One row of a run report table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReportRow {
    pub item: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportTable {
    pub rows: Vec<ReportRow>,
}

impl ReportTable {
    pub fn push(&mut self, item: impl Into<String>, passed: bool, detail: impl Into<String>) {
        self.rows.push(ReportRow {
            item: item.into(),
            passed,
            detail: detail.into(),
        });
    }

    pub fn all_passed(&self) -> bool {
        self.rows.iter().all(|r| r.passed)
    }

    /// Render as an aligned multiline text block, the form stored in the
    /// run built-ins and printed at the end of a build log.
    pub fn render(&self) -> String {
        let width = self
            .rows
            .iter()
            .map(|r| r.item.len())
            .max()
            .unwrap_or(0)
            .max(4);
        let mut out = String::new();
        for row in &self.rows {
            let state = if row.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "{:<width$}  {}  {}\n",
                row.item,
                state,
                row.detail,
                width = width
            ));
        }
        out
    }
}

/// Snapshot of both report tables, serializable for `--print-report`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub actions: ReportTable,
    pub stages: ReportTable,
}

impl RunReport {
    pub fn new(actions: ReportTable, stages: ReportTable) -> Self {
        Self {
            generated_at: Utc::now(),
            actions,
            stages,
        }
    }
}
