//! Core request types for the generation pipeline.
//!
//! A [`GenerationRequest`] is an immutable description of one paid generation. Its
//! [`Fingerprint`] is the cache key and the dedup key: two requests with equal
//! fingerprints never both reach the provider within one run.

use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The kind of artifact a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Icon,
    Illustration,
    Diagram,
    Video,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Icon => "icon",
            AssetKind::Illustration => "illustration",
            AssetKind::Diagram => "diagram",
            AssetKind::Video => "video",
        }
    }

    /// File extension used when the request doesn't specify a `format` parameter.
    pub fn default_extension(&self) -> &'static str {
        match self {
            AssetKind::Video => "mp4",
            _ => "png",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(AssetKind::Image),
            "icon" => Ok(AssetKind::Icon),
            "illustration" => Ok(AssetKind::Illustration),
            "diagram" => Ok(AssetKind::Diagram),
            "video" => Ok(AssetKind::Video),
            other => Err(Error::InvalidRequest(format!("unknown asset kind '{other}'"))),
        }
    }
}

/// An independent budget pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Sample,
    #[default]
    Production,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Sample, Tier::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Sample => "sample",
            Tier::Production => "production",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sample" => Ok(Tier::Sample),
            "production" => Ok(Tier::Production),
            other => Err(Error::InvalidRequest(format!("unknown tier '{other}'"))),
        }
    }
}

/// Stable hash of a normalized request, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint over `(asset_kind, model, normalized prompt)`.
    pub fn compute(asset_kind: AssetKind, model: Option<&str>, prompt: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(asset_kind.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(model.unwrap_or("").as_bytes());
        hasher.update(b"\n");
        hasher.update(normalize_prompt(prompt).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, used for artifact file names and logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unique identifier for a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        TransactionId(uuid)
    }
}

impl std::ops::Deref for TransactionId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier for a batch run. Operators may choose it, so it is a free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a fresh run id like `run_1a2b3c4d`.
    pub fn generate() -> Self {
        let hex = format!("{:x}", Uuid::new_v4().as_u128());
        Self(format!("run_{}", &hex[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One request for a paid generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Text prompt sent to the provider
    pub prompt: String,

    /// What kind of artifact to produce
    pub asset_kind: AssetKind,

    /// Model to use; `None` means the configured default model
    #[serde(default)]
    pub model: Option<String>,

    /// Provider parameters (steps, size, format, ...)
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,

    /// Position within the batch, assigned by the loader
    #[serde(default)]
    pub sequence_index: usize,

    /// Size of the batch this request belongs to
    #[serde(default)]
    pub total_in_batch: usize,

    /// Budget pool charged for this request
    #[serde(default)]
    pub tier: Tier,

    /// Explicit cost, overriding the configured price table
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, asset_kind: AssetKind) -> Self {
        Self {
            prompt: prompt.into(),
            asset_kind,
            model: None,
            parameters: serde_json::Map::new(),
            sequence_index: 0,
            total_in_batch: 1,
            tier: Tier::default(),
            estimated_cost: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.asset_kind, self.model.as_deref(), &self.prompt)
    }

    /// The file extension the artifact should be written with. A `format`
    /// parameter is used only if it is 1-8 ASCII letters or digits.
    pub fn extension(&self) -> String {
        self.parameters
            .get("format")
            .and_then(|v| v.as_str())
            .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| {
                (1..=8).contains(&ext.len())
                    && ext.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            })
            .unwrap_or_else(|| self.asset_kind.default_extension().to_string())
    }
}

/// Assign sequence positions to a freshly loaded list of requests.
pub fn index_requests(mut requests: Vec<GenerationRequest>) -> Vec<GenerationRequest> {
    let total = requests.len();
    for (index, request) in requests.iter_mut().enumerate() {
        request.sequence_index = index;
        request.total_in_batch = total;
    }
    requests
}

/// Load requests from a JSON array file or a JSON-lines file (`.jsonl`).
pub async fn load_requests(path: &Path) -> Result<Vec<GenerationRequest>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let is_jsonl = path
        .extension()
        .map(|ext| ext == "jsonl" || ext == "ndjson")
        .unwrap_or(false);

    let requests: Vec<GenerationRequest> = if is_jsonl {
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(line_no, line)| {
                serde_json::from_str(line).map_err(|e| {
                    Error::InvalidRequest(format!("{}:{}: {}", path.display(), line_no + 1, e))
                })
            })
            .collect::<Result<_>>()?
    } else {
        serde_json::from_str(&contents)?
    };

    for request in &requests {
        if request.prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("empty prompt in request file".to_string()));
        }
    }

    Ok(index_requests(requests))
}
