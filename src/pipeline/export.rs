//! Persisted artifacts of a processed document.
//!
//! Two files per document, both named after the raw text file:
//!
//! * `{intermediate_dir}/{name}.json`: the full [`DocumentResult`], pages
//!   included, for later inspection or re-export.
//! * `{final_dir}/{name}.csv`: one row per interaction with columns
//!   `page_number, ligand, protein, interaction_type, context, Ki, IC50, Kd,
//!   EC50`. A page that passed review with no interactions gets exactly one
//!   row whose interaction fields are all empty. Pages without a
//!   [`crate::output::PageResult`] get no row.
//!
//! Every write goes to a temp file in the target directory and is renamed into place,
//! so re-running an export overwrites cleanly and a crash never leaves a
//! half-written file behind.

use crate::error::ExtractError;
use crate::output::{DocumentResult, Interaction};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// CSV header, in column order.
pub const CSV_COLUMNS: [&str; 9] = [
    "page_number",
    "ligand",
    "protein",
    "interaction_type",
    "context",
    "Ki",
    "IC50",
    "Kd",
    "EC50",
];

/// File locations of one document's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub intermediate: PathBuf,
    pub csv: PathBuf,
}

impl ExportPaths {
    pub fn for_document(intermediate_dir: &Path, final_dir: &Path, name: &str) -> Self {
        Self {
            intermediate: intermediate_dir.join(format!("{name}.json")),
            csv: final_dir.join(format!("{name}.csv")),
        }
    }
}

/// Format a parameter value; whole numbers keep one decimal (`10.0`).
pub fn format_value(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn interaction_fields(page_number: u32, interaction: &Interaction) -> Vec<String> {
    let mut row = vec![
        page_number.to_string(),
        interaction.ligand.clone(),
        interaction.protein.clone(),
        interaction.interaction_type.clone(),
        interaction.context.clone(),
    ];
    row.extend(
        interaction
            .parameters
            .named()
            .iter()
            .map(|(_, v)| v.map(format_value).unwrap_or_default()),
    );
    row
}

/// Flatten a document result into table rows (header excluded).
pub fn csv_rows(result: &DocumentResult) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for page_result in &result.pages {
        let number = page_result.page.number;
        if page_result.interactions.is_empty() {
            let mut row = vec![String::new(); CSV_COLUMNS.len()];
            row[0] = number.to_string();
            rows.push(row);
        } else {
            rows.extend(
                page_result
                    .interactions
                    .iter()
                    .map(|i| interaction_fields(number, i)),
            );
        }
    }
    rows
}

/// Quote a field when it contains a separator, quote, or line break.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render the full CSV document, header first, `\n` line endings.
pub fn to_csv(result: &DocumentResult) -> String {
    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');
    for row in csv_rows(result) {
        let line: Vec<String> = row.iter().map(|f| escape_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

/// Write `bytes` to `path` via a temp file and rename, creating parent dirs.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExtractError> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes))
        .await
        .map_err(|e| ExtractError::Internal(format!("Write task panicked: {}", e)))?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), ExtractError> {
    let write_err = |source| ExtractError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(write_err)?;

    // Unique temp name in the same directory so the rename stays atomic
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    debug!("Wrote {} bytes to '{}'", bytes.len(), path.display());
    Ok(())
}

pub async fn write_csv(path: &Path, result: &DocumentResult) -> Result<(), ExtractError> {
    write_atomic(path, to_csv(result).as_bytes()).await
}

pub async fn write_intermediate(path: &Path, result: &DocumentResult) -> Result<(), ExtractError> {
    let bytes = serde_json::to_vec_pretty(result)?;
    write_atomic(path, &bytes).await
}

pub async fn read_intermediate(path: &Path) -> Result<DocumentResult, ExtractError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ExtractError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write both artifacts of one document.
pub async fn export_document(paths: &ExportPaths, result: &DocumentResult) -> Result<(), ExtractError> {
    write_intermediate(&paths.intermediate, result).await?;
    write_csv(&paths.csv, result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{InteractionParameters, Page, PageResult};

    fn interaction(ligand: &str, params: InteractionParameters) -> Interaction {
        Interaction {
            ligand: ligand.into(),
            protein: "BTK".into(),
            interaction_type: "binding".into(),
            context: "binds".into(),
            parameters: params,
        }
    }

    fn page_result(number: u32, interactions: Vec<Interaction>) -> PageResult {
        PageResult {
            page: Page::new(number, "text"),
            interactions,
        }
    }

    #[test]
    fn empty_document_is_header_only() {
        let csv = to_csv(&DocumentResult::default());
        assert_eq!(
            csv,
            "page_number,ligand,protein,interaction_type,context,Ki,IC50,Kd,EC50\n"
        );
    }

    #[test]
    fn page_without_interactions_gets_one_blank_row() {
        let result = DocumentResult {
            pages: vec![page_result(7, vec![])],
        };
        let rows = csv_rows(&result);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "7");
        assert!(rows[0][1..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn k_interactions_give_k_rows_with_shared_page_number() {
        let result = DocumentResult {
            pages: vec![page_result(
                2,
                vec![
                    interaction("a", InteractionParameters::default()),
                    interaction("b", InteractionParameters::default()),
                    interaction("c", InteractionParameters::default()),
                ],
            )],
        };
        let rows = csv_rows(&result);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r[0] == "2"));
    }

    #[test]
    fn kd_only_row_layout() {
        let params = InteractionParameters {
            kd: Some(10.0),
            ..Default::default()
        };
        let result = DocumentResult {
            pages: vec![page_result(1, vec![interaction("L", params)])],
        };
        let csv = to_csv(&result);
        let line = csv.lines().nth(1).unwrap();
        assert_eq!(line, "1,L,BTK,binding,binds,,,10.0,");
    }

    #[test]
    fn fields_with_commas_and_quotes_are_escaped() {
        let mut i = interaction("L", InteractionParameters::default());
        i.context = "a \"quoted\", multi\nline excerpt".into();
        let result = DocumentResult {
            pages: vec![page_result(1, vec![i])],
        };
        let csv = to_csv(&result);
        assert!(csv.contains("\"a \"\"quoted\"\", multi\nline excerpt\""));
    }

    #[test]
    fn value_formatting() {
        assert_eq!(format_value(10.0), "10.0");
        assert_eq!(format_value(0.25), "0.25");
        assert_eq!(format_value(1500.0), "1500.0");
    }

    #[tokio::test]
    async fn export_writes_both_artifacts_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ExportPaths::for_document(
            &dir.path().join("intermediate"),
            &dir.path().join("final"),
            "US1.txt",
        );
        let result = DocumentResult {
            pages: vec![page_result(3, vec![])],
        };

        export_document(&paths, &result).await.unwrap();
        export_document(&paths, &result).await.unwrap();

        assert_eq!(paths.csv, dir.path().join("final/US1.txt.csv"));
        assert_eq!(read_intermediate(&paths.intermediate).await.unwrap(), result);
        let csv = std::fs::read_to_string(&paths.csv).unwrap();
        assert_eq!(csv.lines().count(), 2);
    }
}
