use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The task category a benchmark template exercises.
///
/// Derived from the template identifier by substring match, so template
/// files can be named freely (`classification-analysis.js.j2`,
/// `embedding-suite.js.j2`, ...) as long as the category appears in the
/// name. The category also forms the top level of the on-disk cache
/// partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Task {
    /// Text classification requests.
    Classification,
    /// Text embedding requests.
    Embedding,
    /// Image embedding requests.
    VisionEmbedding,
}

impl Task {
    /// Derive the task category from a template identifier.
    ///
    /// Returns [`Error::UnknownTask`] when the identifier matches no
    /// category; that is a configuration bug and aborts the session before
    /// any trial runs.
    pub fn from_template(template: &str) -> Result<Self, Error> {
        // "vision-embedding" contains "embedding", so test it first
        if template.contains("vision-embedding") {
            Ok(Task::VisionEmbedding)
        } else if template.contains("classification") {
            Ok(Task::Classification)
        } else if template.contains("embedding") {
            Ok(Task::Embedding)
        } else {
            Err(Error::UnknownTask(template.to_owned()))
        }
    }

    /// The category name as used in cache paths.
    pub fn as_str(self) -> &'static str {
        match self {
            Task::Classification => "classification",
            Task::Embedding => "embedding",
            Task::VisionEmbedding => "vision-embedding",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable configuration for one benchmarking session.
///
/// Created once and handed to the runner at construction time; nothing here
/// changes between trials. The template directory, the rendered-script
/// location, and the API credential are all explicit fields rather than
/// process-wide state, so independent sessions can coexist in one process.
#[derive(Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Dataset the load generator samples request payloads from.
    pub dataset_path: PathBuf,
    /// Name of the dataset column holding the request text.
    pub text_column: String,
    /// Total number of requests issued per trial.
    pub total_requests: u64,
    /// Per-trial duration, in the load generator's syntax (e.g. `"1m"`).
    pub duration: String,
    /// Template identifier; also determines the [`Task`] category.
    pub template: String,
    /// Directory the template is loaded from.
    pub template_dir: PathBuf,
    /// Path to the load-generator binary.
    pub k6_bin: PathBuf,
    /// Fixed location the rendered script is written to, overwritten each
    /// trial.
    pub script_path: PathBuf,
    /// Credential injected into the load generator's environment as
    /// `HF_TOKEN`, if the endpoint requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

impl fmt::Debug for BenchmarkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkConfig")
            .field("dataset_path", &self.dataset_path)
            .field("text_column", &self.text_column)
            .field("total_requests", &self.total_requests)
            .field("duration", &self.duration)
            .field("template", &self.template)
            .field("template_dir", &self.template_dir)
            .field("k6_bin", &self.k6_bin)
            .field("script_path", &self.script_path)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[test]
fn classification_template() {
    assert_eq!(
        Task::from_template("classification-analysis.js.j2").unwrap(),
        Task::Classification
    );
}

#[test]
fn vision_embedding_wins_over_embedding() {
    assert_eq!(
        Task::from_template("vision-embedding-suite.js.j2").unwrap(),
        Task::VisionEmbedding
    );
    assert_eq!(
        Task::from_template("embedding-suite.js.j2").unwrap(),
        Task::Embedding
    );
}

#[test]
fn unknown_template() {
    let err = Task::from_template("foo.js.j2").unwrap_err();
    assert!(matches!(err, Error::UnknownTask(t) if t == "foo.js.j2"));
}

#[test]
fn token_is_redacted_in_debug_output() {
    let config = BenchmarkConfig {
        dataset_path: PathBuf::from("data.csv"),
        text_column: "text".to_owned(),
        total_requests: 1000,
        duration: "1m".to_owned(),
        template: "classification-analysis.js.j2".to_owned(),
        template_dir: PathBuf::from("templates"),
        k6_bin: PathBuf::from("k6"),
        script_path: PathBuf::from("generated/script.js"),
        api_token: Some("hf_secret".to_owned()),
    };
    let dbg = format!("{:?}", config);
    assert!(!dbg.contains("hf_secret"));
    assert!(dbg.contains("<redacted>"));
}
