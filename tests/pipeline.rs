//! Full document pipeline with in-process collaborators: a fake text
//! extractor, a keyword-scripted role runner and a fake patent registry.
//! No network, no pdfium.

use async_trait::async_trait;
use patent_ligands::pipeline::export::read_intermediate;
use patent_ligands::pipeline::text::{page_divider, ExtractionResults, TextExtractor};
use patent_ligands::registry::pdf_path;
use patent_ligands::steps::SAVED_RESULTS;
use patent_ligands::{
    document_orchestrator, initial_context, patent_orchestrator, CancellationToken, Collaborators,
    ExtractError, ExtractionConfig, ExtractionProgressCallback, PatentRegistry, Role, RoleError,
    RoleRunner, RunOutcome,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Relevant when the page mentions nM; the ligand "X" is always rejected
/// by the validator as unfixable.
#[derive(Default)]
struct Keyword {
    extract_inputs: Mutex<Vec<String>>,
}

#[async_trait]
impl RoleRunner for Keyword {
    async fn run(&self, role: Role, input: &str) -> Result<Value, RoleError> {
        Ok(match role {
            Role::Search => json!({
                "does_contain_interactions": input.contains("nM"),
                "confidence": 0.9
            }),
            Role::Extract => {
                self.extract_inputs.lock().unwrap().push(input.to_string());
                let ligand = if input.contains("Example 3") { "X" } else { "L" };
                json!({"interactions": [{
                    "ligand": ligand,
                    "protein": "BTK",
                    "interaction_type": "binding",
                    "context": format!("{ligand} binds BTK"),
                    "parameters": {"Kd": 10.0}
                }]})
            }
            Role::Validate => {
                let candidate: String = input.chars().filter(|c| !c.is_whitespace()).collect();
                if candidate.contains("\"ligand\":\"X\"") {
                    json!({"is_correct": false, "fixable": false, "explanation": "X is not in the text"})
                } else {
                    json!({"is_correct": true, "fixable": false})
                }
            }
            Role::Repair => json!({"interactions": []}),
        })
    }
}

/// Writes fixed page-divided files instead of reading PDFs.
struct FakeExtractor {
    raw_dir: PathBuf,
    documents: Vec<(&'static str, Vec<(u32, &'static str)>)>,
    calls: AtomicUsize,
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract_texts(&self, _documents_dir: &Path) -> Result<ExtractionResults, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(&self.raw_dir).unwrap();
        let mut new_outputs = Vec::new();
        for (name, pages) in &self.documents {
            let mut text = String::new();
            for (n, body) in pages {
                text.push_str(&page_divider(*n));
                text.push('\n');
                text.push_str(body);
                text.push('\n');
            }
            let path = self.raw_dir.join(name);
            std::fs::write(&path, text).unwrap();
            new_outputs.push(path);
        }
        Ok(ExtractionResults {
            count_new: new_outputs.len(),
            count_total: new_outputs.len(),
            new_outputs,
            ..Default::default()
        })
    }
}

struct OnePatent {
    fetched: AtomicUsize,
}

#[async_trait]
impl PatentRegistry for OnePatent {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<String>, ExtractError> {
        Ok(vec!["7654321".into()])
    }

    async fn fetch(&self, patent_id: &str, destination: &Path) -> Result<bool, ExtractError> {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        std::fs::write(pdf_path(destination, patent_id), b"%PDF-1.4").unwrap();
        Ok(true)
    }
}

/// Cancels the run after the first finished document.
struct CancelAfterFirst(CancellationToken);

impl ExtractionProgressCallback for CancelAfterFirst {
    fn on_document_complete(&self, _name: &str, _pages: usize, _interactions: usize) {
        self.0.cancel();
    }
}

fn two_documents(raw_dir: PathBuf) -> FakeExtractor {
    FakeExtractor {
        raw_dir,
        documents: vec![
            (
                "US1.txt",
                vec![
                    (1, "Compound L binds BTK with a Kd of 10 nM."),
                    (2, "Background of the invention."),
                    (3, "Example 3: compound X inhibits BTK at 5 nM."),
                ],
            ),
            ("US2.txt", vec![(4, "Assay: L binds BTK (Kd 10 nM).")]),
        ],
        calls: AtomicUsize::new(0),
    }
}

fn config(root: &Path) -> ExtractionConfig {
    ExtractionConfig::builder()
        .output_root(root)
        .documents_dir(root.join("patents"))
        .retry_backoff_ms(0)
        .build()
        .unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn document_pipeline_exports_reviewed_interactions() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let runner = Arc::new(Keyword::default());
    let collaborators = Collaborators {
        runner: runner.clone(),
        extractor: Arc::new(two_documents(config.raw_text_dir.clone())),
        registry: None,
    };

    let orchestrator = document_orchestrator(&config, &collaborators).unwrap();
    let outcome = orchestrator
        .run(initial_context(&config).unwrap(), &CancellationToken::new())
        .await
        .unwrap();
    let RunOutcome::Completed {
        steps_run,
        resumed_from,
        context,
    } = outcome
    else {
        panic!("unexpected outcome: {outcome:?}");
    };
    assert_eq!((steps_run, resumed_from), (4, 0));
    let saved: Vec<PathBuf> = context.require(SAVED_RESULTS, "test").unwrap();
    assert_eq!(
        saved,
        vec![
            config.final_dir.join("US1.txt.csv"),
            config.final_dir.join("US2.txt.csv")
        ]
    );

    let csv = std::fs::read_to_string(config.final_dir.join("US1.txt.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines,
        vec![
            "page_number,ligand,protein,interaction_type,context,Ki,IC50,Kd,EC50",
            "1,L,BTK,binding,L binds BTK,,,10.0,",
        ]
    );

    let record = read_intermediate(&config.intermediate_dir.join("US1.txt.json"))
        .await
        .unwrap();
    assert_eq!(record.pages.len(), 1);
    assert_eq!(record.pages[0].page.number, 1);
    assert_eq!(record.pages[0].page.text, "Compound L binds BTK with a Kd of 10 nM.");

    let csv = std::fs::read_to_string(config.final_dir.join("US2.txt.csv")).unwrap();
    assert!(csv.contains("\n4,L,BTK,binding,L binds BTK,,,10.0,\n"));

    // Not-relevant page 2 never reached the extractor.
    let inputs = runner.extract_inputs.lock().unwrap();
    assert_eq!(inputs.len(), 3);
    assert!(inputs.iter().all(|i| !i.contains("Background")));
    assert!(orchestrator.checkpoint_store().load().await.is_none());
}

#[tokio::test]
async fn cancelled_run_resumes_with_the_next_document() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let config = ExtractionConfig::builder()
        .output_root(dir.path())
        .documents_dir(dir.path().join("patents"))
        .retry_backoff_ms(0)
        .progress_callback(Arc::new(CancelAfterFirst(token.clone())))
        .build()
        .unwrap();
    let runner = Arc::new(Keyword::default());
    let extractor = Arc::new(two_documents(config.raw_text_dir.clone()));
    let collaborators = Collaborators {
        runner: runner.clone(),
        extractor: extractor.clone(),
        registry: None,
    };
    let orchestrator = document_orchestrator(&config, &collaborators).unwrap();

    let outcome = orchestrator
        .run(initial_context(&config).unwrap(), &token)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Cancelled {
            step: "process_documents".into(),
            units_done: 1
        }
    );
    assert_eq!(runner.extract_inputs.lock().unwrap().len(), 2);
    assert!(!config.final_dir.join("US1.txt.csv").exists());

    let outcome = orchestrator
        .run(initial_context(&config).unwrap(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Completed {
            steps_run: 2,
            resumed_from: 2,
            ..
        }
    ));

    // Text extraction and US1 were not repeated; both documents were exported.
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(runner.extract_inputs.lock().unwrap().len(), 3);
    assert!(config.final_dir.join("US1.txt.csv").exists());
    assert!(config.final_dir.join("US2.txt.csv").exists());
}

#[tokio::test]
async fn patent_pipeline_tops_up_the_batch_first() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExtractionConfig::builder()
        .output_root(dir.path())
        .documents_dir(dir.path().join("patents"))
        .patents_per_batch(1)
        .retry_backoff_ms(0)
        .build()
        .unwrap();
    let registry = Arc::new(OnePatent {
        fetched: AtomicUsize::new(0),
    });
    let collaborators = Collaborators {
        runner: Arc::new(Keyword::default()),
        extractor: Arc::new(two_documents(config.raw_text_dir.clone())),
        registry: Some(registry.clone()),
    };

    let orchestrator = patent_orchestrator(&config, &collaborators).unwrap();
    orchestrator
        .run(initial_context(&config).unwrap(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(registry.fetched.load(Ordering::SeqCst), 1);
    assert!(config.documents_dir.join("US7654321.pdf").exists());
    assert!(config.final_dir.join("US2.txt.csv").exists());
}

#[tokio::test]
async fn missing_registry_fails_in_check_patents() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let collaborators = Collaborators {
        runner: Arc::new(Keyword::default()),
        extractor: Arc::new(two_documents(config.raw_text_dir.clone())),
        registry: None,
    };

    let orchestrator = patent_orchestrator(&config, &collaborators).unwrap();
    let err = orchestrator
        .run(initial_context(&config).unwrap(), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ExtractError::StepFailed { step, source } => {
            assert_eq!(step, "check_patents");
            assert!(matches!(*source, ExtractError::RegistryKeyMissing));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
