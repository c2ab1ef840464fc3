use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─────────────────────────────────────────────────────────────────────────────
// Query & planning
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of query intents. Drives search-kind selection and prompt
/// framing; immutable once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Informational,
    News,
    Code,
    Research,
    Comparative,
    Tutorial,
    General,
}

impl IntentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "informational" => Some(Self::Informational),
            "news" => Some(Self::News),
            "code" => Some(Self::Code),
            "research" => Some(Self::Research),
            "comparative" => Some(Self::Comparative),
            "tutorial" => Some(Self::Tutorial),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::News => "news",
            Self::Code => "code",
            Self::Research => "research",
            Self::Comparative => "comparative",
            Self::Tutorial => "tutorial",
            Self::General => "general",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub intent: IntentKind,
}

/// One planned search, with a priority in 1..=5 (1 = highest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub query: Query,
    /// Ordered report section titles. Never empty.
    pub sections: Vec<String>,
    /// Initial search queries for iteration 1. Never empty.
    pub search_queries: Vec<SearchQuery>,
    pub rationale: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Search & scrape artifacts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Canonicalized URL (lowercase scheme+host, no fragment, no trailing
    /// slash, tracking params dropped).
    pub url: String,
    pub title: String,
    pub snippet: String,
    /// 1-based, contiguous within a provider response.
    pub rank: u32,
    pub provider_tag: String,
}

/// Which extraction tier produced a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorTier {
    /// Local HTML fetch + Markdown conversion.
    Primary,
    /// External markdown-extractor service (JS-capable).
    Fallback1,
    /// External scrape API.
    Fallback2,
}

/// A scraped page. An empty `markdown_body` is a permitted value; downstream
/// stages must treat it as "unavailable".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedContent {
    pub url: String,
    pub title: String,
    pub markdown_body: String,
    pub retrieved_at: DateTime<Utc>,
    pub extractor_tier: ExtractorTier,
    pub tables_found: usize,
    pub tables_converted: usize,
}

impl ScrapedContent {
    pub fn is_unavailable(&self) -> bool {
        self.markdown_body.trim().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summaries & context
// ─────────────────────────────────────────────────────────────────────────────

/// Content type derived from URL heuristics; routes summarization models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Research,
    Code,
    News,
    Documentation,
    General,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Code => "code",
            Self::News => "news",
            Self::Documentation => "documentation",
            Self::General => "general",
        }
    }
}

/// A Markdown pipe table kept verbatim through summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MarkdownTable {
    pub fn cols(&self) -> usize {
        self.header.len()
    }
}

/// A large table reduced to header + salient rows + an aggregate note
/// computed in-process (never by the model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub source_url: String,
    pub title: String,
    pub text: String,
    /// URLs cited by this summary; always a subset of the run's scraped URLs.
    pub citations: BTreeSet<String>,
    pub content_type: ContentType,
    #[serde(default)]
    pub preserved_tables: Vec<MarkdownTable>,
    #[serde(default)]
    pub compacted_tables: Vec<CompactedTable>,
}

/// Output of the context assembler: the summaries that made the cut, ranked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPackage {
    /// Descending score order.
    pub selected_summaries: Vec<Summary>,
    /// Score per selected summary URL, in [0, 1].
    pub scores: BTreeMap<String, f32>,
    pub excluded_count: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reflection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub complete: bool,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub additional_queries: Vec<SearchQuery>,
    #[serde(default)]
    pub rationale: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub markdown_body: String,
}

/// A numbered source reference; `[Source N]` markers in section bodies
/// resolve into this list (1-based).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub number: usize,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub query: String,
    pub intent: IntentKind,
    pub sections: Vec<ReportSection>,
    pub sources: Vec<SourceRef>,
    pub generated_at: DateTime<Utc>,
    /// Coverage gaps from the final reflection, when the loop ended
    /// incomplete. Rendered as "Research Limitations".
    #[serde(default)]
    pub limitations: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    Factual,
    Statistic,
    Quote,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedClaim {
    pub claim_text: String,
    /// 1-based index into `Report.sources`.
    pub source_number: usize,
    pub claim_type: ClaimType,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Supported,
    Partial,
    Unsupported,
    Contradicted,
    /// The cached source body was empty; the claim could not be checked.
    Unverifiable,
}

impl Verdict {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supported" => Some(Self::Supported),
            "partial" => Some(Self::Partial),
            "unsupported" => Some(Self::Unsupported),
            "contradicted" => Some(Self::Contradicted),
            "unverifiable" => Some(Self::Unverifiable),
            _ => None,
        }
    }

    pub fn is_adverse(&self) -> bool {
        matches!(
            self,
            Self::Unsupported | Self::Contradicted | Self::Unverifiable
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub claim_text: String,
    pub source_url: String,
    pub verdict: Verdict,
    /// In [0, 1].
    pub confidence: f32,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub supported: usize,
    pub partial: usize,
    pub unsupported: usize,
    pub contradicted: usize,
    pub unverifiable: usize,
    /// Results with `confidence < threshold` or an adverse verdict.
    pub flagged: Vec<VerificationResult>,
    pub results: Vec<VerificationResult>,
}

impl VerificationSummary {
    pub fn from_results(results: Vec<VerificationResult>, threshold: f32) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for r in &results {
            match r.verdict {
                Verdict::Supported => summary.supported += 1,
                Verdict::Partial => summary.partial += 1,
                Verdict::Unsupported => summary.unsupported += 1,
                Verdict::Contradicted => summary.contradicted += 1,
                Verdict::Unverifiable => summary.unverifiable += 1,
            }
            if r.confidence < threshold || r.verdict.is_adverse() {
                summary.flagged.push(r.clone());
            }
        }
        summary.results = results;
        summary
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ranking math
// ─────────────────────────────────────────────────────────────────────────────

/// Effective item count for a selection ratio in (0.0, 1.0]: at least one
/// item is always selected when any exist.
pub fn effective_count(ratio: f64, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((ratio * n as f64).ceil() as usize).clamp(1, n)
}
