//! Built-in tools
//!
//! - `summarize`: per-column statistics of a tabular dataset, written to
//!   `reports/summary.json`
//! - `insight`: a narrative over the latest summary from the provider
//!   router, written to `reports/insight.md`

use crate::tool::{FileParam, Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use sluice_core::{Result, SluiceError, SubareaKind};
use sluice_resilience::CompletionRequest;
use sluice_validation::tabular::{detect_delimiter, DelimitedReader};
use sluice_validation::InputKind;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUMMARY_ARTIFACT: &str = "summary.json";
pub const INSIGHT_ARTIFACT: &str = "insight.md";

/// Distinct values tracked per column before counting stops
const DISTINCT_LIMIT: usize = 10_000;

/// Statistics for one column
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub non_empty: u64,
    pub missing: u64,
    /// Distinct values, saturating at the tracking limit
    pub distinct: usize,
    pub numeric: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
}

/// Statistics for a whole table
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub source: PathBuf,
    pub rows: u64,
    pub columns: Vec<ColumnSummary>,
}

#[derive(Default)]
struct ColumnAccumulator {
    non_empty: u64,
    missing: u64,
    numeric_count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    distinct: HashSet<String>,
}

impl ColumnAccumulator {
    fn push(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            self.missing += 1;
            return;
        }
        self.non_empty += 1;
        if self.distinct.len() < DISTINCT_LIMIT {
            self.distinct.insert(value.to_string());
        }
        if let Ok(number) = value.parse::<f64>() {
            if number.is_finite() {
                self.numeric_count += 1;
                self.sum += number;
                self.min = Some(self.min.map_or(number, |m| m.min(number)));
                self.max = Some(self.max.map_or(number, |m| m.max(number)));
            }
        }
    }

    fn finish(self, name: String) -> ColumnSummary {
        let numeric = self.non_empty > 0 && self.numeric_count == self.non_empty;
        ColumnSummary {
            name,
            non_empty: self.non_empty,
            missing: self.missing,
            distinct: self.distinct.len(),
            numeric,
            min: if numeric { self.min } else { None },
            max: if numeric { self.max } else { None },
            mean: numeric.then(|| self.sum / self.numeric_count as f64),
        }
    }
}

/// Summarise a delimited text table
pub fn summarize_table(path: &Path) -> Result<DatasetSummary> {
    let mut first_line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first_line)?;
    let delimiter = detect_delimiter(&first_line);

    let mut records = DelimitedReader::new(BufReader::new(File::open(path)?), delimiter);
    let header = match records.next() {
        Some(header) => header?,
        None => return Err(SluiceError::Other(format!("{} has no header row", path.display()))),
    };

    let mut columns: Vec<ColumnAccumulator> = header.iter().map(|_| ColumnAccumulator::default()).collect();
    let mut rows = 0u64;
    for record in records {
        let record = record?;
        rows += 1;
        for (column, value) in columns.iter_mut().zip(record.iter()) {
            column.push(value);
        }
        // Short rows count as missing in the trailing columns
        for column in columns.iter_mut().skip(record.len()) {
            column.missing += 1;
        }
    }

    Ok(DatasetSummary {
        source: path.to_path_buf(),
        rows,
        columns: columns
            .into_iter()
            .zip(header)
            .map(|(column, name)| column.finish(name.trim().to_string()))
            .collect(),
    })
}

/// Column statistics of a tabular dataset
pub struct SummarizeTool;

#[async_trait]
impl Tool for SummarizeTool {
    fn name(&self) -> &str {
        "summarize"
    }

    fn description(&self) -> &str {
        "Per-column statistics of a tabular dataset"
    }

    fn file_params(&self) -> Vec<FileParam> {
        vec![FileParam::new("dataset", InputKind::Tabular)]
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput> {
        let dataset = ctx.input("dataset")?.to_path_buf();
        if let Some(ext) = dataset.extension().and_then(|e| e.to_str()) {
            if matches!(ext.to_lowercase().as_str(), "parquet" | "feather" | "arrow" | "xlsx" | "xls") {
                return Err(SluiceError::Other(format!(
                    "summarize reads delimited text; {} is a .{} file, export it as CSV first",
                    dataset.display(),
                    ext
                )));
            }
        }

        let summary = tokio::task::spawn_blocking(move || summarize_table(&dataset))
            .await
            .map_err(|e| SluiceError::Other(format!("summary task failed: {}", e)))??;

        let output = ctx.scratch_path(SUMMARY_ARTIFACT);
        tokio::fs::write(&output, serde_json::to_vec_pretty(&summary)?).await?;

        info!(rows = summary.rows, columns = summary.columns.len(), "Dataset summarised");
        Ok(ToolOutput::new(serde_json::to_value(&summary)?).with_file(
            SUMMARY_ARTIFACT,
            output,
            SubareaKind::Reports,
        ))
    }
}

/// Narrative insight over the latest summary
pub struct InsightTool;

impl InsightTool {
    fn prompt(summary: &Value, question: Option<&str>) -> String {
        let mut prompt = String::from(
            "Here is a statistical summary of a dataset, as JSON.\n\n```json\n",
        );
        prompt.push_str(&serde_json::to_string_pretty(summary).unwrap_or_default());
        prompt.push_str("\n```\n\n");
        match question {
            Some(question) => {
                prompt.push_str("Answer this question about the data: ");
                prompt.push_str(question);
            }
            None => prompt.push_str(
                "Describe the three most notable findings, and suggest one follow-up analysis.",
            ),
        }
        prompt
    }
}

#[async_trait]
impl Tool for InsightTool {
    fn name(&self) -> &str {
        "insight"
    }

    fn description(&self) -> &str {
        "Narrative findings over the latest dataset summary"
    }

    async fn run(&self, ctx: ToolContext) -> Result<ToolOutput> {
        let record = ctx.artifacts().latest(SUMMARY_ARTIFACT).await?.ok_or_else(|| {
            SluiceError::Artifact(format!(
                "no {} in this workspace; run 'summarize' first",
                SUMMARY_ARTIFACT
            ))
        })?;
        let summary: Value = serde_json::from_slice(&tokio::fs::read(&record.path).await?)?;

        let request = CompletionRequest::new(Self::prompt(&summary, ctx.arg_str("question")))
            .with_system("You are a careful data analyst. Be concise and concrete.");
        let response = ctx.complete(&request).await?;

        let output = ctx.scratch_path(INSIGHT_ARTIFACT);
        let document = format!(
            "# Insight\n\n{}\n\n---\nGenerated by {} ({}) from {} v{}\n",
            response.text.trim(),
            response.provider,
            response.model,
            record.name,
            record.version
        );
        tokio::fs::write(&output, document).await?;

        Ok(ToolOutput::new(json!({
            "provider": response.provider,
            "model": response.model,
            "insight": response.text,
            "summary_version": record.version,
        }))
        .with_file(INSIGHT_ARTIFACT, output, SubareaKind::Reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_summarize_table_numeric_and_text_columns() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sales.csv");
        std::fs::write(&path, "region,units\nnorth,3\nsouth,5\nnorth,\n").unwrap();

        let summary = summarize_table(&path).unwrap();
        assert_eq!(summary.rows, 3);

        let region = &summary.columns[0];
        assert_eq!(region.name, "region");
        assert!(!region.numeric);
        assert_eq!(region.distinct, 2);
        assert_eq!(region.min, None);

        let units = &summary.columns[1];
        assert!(units.numeric);
        assert_eq!(units.missing, 1);
        assert_eq!(units.min, Some(3.0));
        assert_eq!(units.max, Some(5.0));
        assert_eq!(units.mean, Some(4.0));
    }

    #[test]
    fn test_summarize_table_semicolon_delimited() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("eu.csv");
        std::fs::write(&path, "a;b\n1;2\n").unwrap();

        let summary = summarize_table(&path).unwrap();
        assert_eq!(summary.columns.len(), 2);
        assert_eq!(summary.columns[1].name, "b");
    }

    #[test]
    fn test_insight_prompt_includes_question() {
        let prompt = InsightTool::prompt(&json!({"rows": 2}), Some("Which region sells most?"));
        assert!(prompt.contains("\"rows\": 2"));
        assert!(prompt.ends_with("Which region sells most?"));
    }
}
