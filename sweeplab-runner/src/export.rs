//! Table export — CSV, JSON and Markdown.
//!
//! - **CSV**: header row plus one row per table row
//! - **JSON**: the structured form of whatever produced the table (plot cells
//!   with range flags and counts, or group summaries)
//! - **Markdown**: a pipe table under a heading, for reports
//!
//! Rendered formats (`pdf`, `png`, `svg`) belong to an external renderer and
//! are reported back as skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown output type '{0}'")]
    UnknownOutputType(String),
}

/// A plain text table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutputType {
    Csv,
    Json,
    Markdown,
    /// Handled by an external renderer.
    Rendered(String),
}

impl OutputType {
    pub fn extension(&self) -> &str {
        match self {
            OutputType::Csv => "csv",
            OutputType::Json => "json",
            OutputType::Markdown => "md",
            OutputType::Rendered(ext) => ext,
        }
    }
}

impl FromStr for OutputType {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputType::Csv),
            "json" => Ok(OutputType::Json),
            "md" | "markdown" => Ok(OutputType::Markdown),
            ext @ ("pdf" | "png" | "svg") => Ok(OutputType::Rendered(ext.to_string())),
            _ => Err(ExportError::UnknownOutputType(s.to_string())),
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Parse a list of output type names, rejecting unknown ones up front.
pub fn parse_output_types(names: &[String]) -> Result<Vec<OutputType>, ExportError> {
    names.iter().map(|n| n.parse()).collect()
}

/// What [`write_outputs`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

impl ExportReport {
    pub fn extend(&mut self, other: ExportReport) {
        self.written.extend(other.written);
        self.skipped.extend(other.skipped);
    }
}

pub fn to_csv(table: &Table) -> Result<String, ExportError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(&table.headers)?;
    for row in &table.rows {
        wtr.write_record(row)?;
    }
    let data = wtr
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

pub fn to_markdown(table: &Table) -> String {
    let escape = |s: &str| s.replace('|', "\\|");
    let mut md = String::new();
    md.push_str(&format!("## {}\n\n", table.title));
    md.push_str(&format!(
        "| {} |\n",
        table
            .headers
            .iter()
            .map(|h| escape(h))
            .collect::<Vec<_>>()
            .join(" | ")
    ));
    md.push_str(&format!(
        "|{}|\n",
        vec!["---"; table.headers.len()].join("|")
    ));
    for row in &table.rows {
        md.push_str(&format!(
            "| {} |\n",
            row.iter().map(|c| escape(c)).collect::<Vec<_>>().join(" | ")
        ));
    }
    md
}

fn write_file(path: &Path, contents: &str) -> Result<(), ExportError> {
    fs::write(path, contents).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `{dir}/{stem}.{ext}` for every output type. JSON carries `detail`,
/// the structured source of the table.
pub fn write_outputs<T: Serialize>(
    dir: &Path,
    stem: &str,
    table: &Table,
    detail: &T,
    outputs: &[OutputType],
) -> Result<ExportReport, ExportError> {
    fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut report = ExportReport::default();
    for output in outputs {
        let path = dir.join(format!("{stem}.{}", output.extension()));
        match output {
            OutputType::Csv => write_file(&path, &to_csv(table)?)?,
            OutputType::Json => write_file(&path, &serde_json::to_string_pretty(detail)?)?,
            OutputType::Markdown => write_file(&path, &to_markdown(table))?,
            OutputType::Rendered(_) => {
                debug!(path = %path.display(), "rendered output left to external renderer");
                report.skipped.push(path);
                continue;
            }
        }
        info!(path = %path.display(), "wrote table");
        report.written.push(path);
    }
    Ok(report)
}
