//! Report generation (REPORT stage) and file rendering.
//!
//! The model writes the section bodies; everything structural: source
//! numbering, citation validation, the Sources section, limitations, the
//! verification appendix: is assembled here. Every `[Source N]` that
//! survives validation resolves to an entry in `Report.sources`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};

use crate::core::config::{OutputFormat, Settings};
use crate::core::error::PipelineResult;
use crate::core::types::{
    ContextPackage, Query, Report, ReportSection, SourceRef, VerificationSummary,
};
use crate::llm::gateway::LlmGateway;
use crate::prompts;

pub async fn generate_report(
    gateway: &LlmGateway,
    settings: &Settings,
    query: &Query,
    sections: &[String],
    context: &ContextPackage,
    limitations: Vec<String>,
    metadata: BTreeMap<String, serde_json::Value>,
) -> PipelineResult<Report> {
    let numbered: Vec<(usize, &crate::core::types::Summary)> = context
        .selected_summaries
        .iter()
        .enumerate()
        .map(|(i, s)| (i + 1, s))
        .collect();

    let body = gateway
        .complete_text(
            &prompts::report_prompt(Utc::now(), &query.text, query.intent, sections, &numbered),
            settings.report_model(),
            0.4,
            Some(settings.report_max_tokens),
        )
        .await?;

    let (validated, removed) = validate_citations(&body, numbered.len());
    if removed > 0 {
        warn!(
            stage = "report",
            item = %query.text,
            error_kind = "invalid_citation",
            cause = format!("{removed} citation(s) outside 1..={}", numbered.len()),
            "stripped citations that resolve to no source"
        );
    }

    let sources = context
        .selected_summaries
        .iter()
        .enumerate()
        .map(|(i, s)| SourceRef {
            number: i + 1,
            url: s.source_url.clone(),
            title: s.title.clone(),
        })
        .collect();

    Ok(Report {
        query: query.text.clone(),
        intent: query.intent,
        sections: split_sections(&validated, sections),
        sources,
        generated_at: Utc::now(),
        limitations,
        metadata,
    })
}

/// Remove `[Source N]` markers whose N does not resolve to a numbered source.
pub fn validate_citations(body: &str, source_count: usize) -> (String, usize) {
    let citation = Regex::new(r"\[Source (\d+)\]").expect("static regex");
    let mut removed = 0usize;
    let out = citation.replace_all(body, |caps: &regex::Captures<'_>| {
        let n: usize = caps[1].parse().unwrap_or(0);
        if n >= 1 && n <= source_count {
            caps[0].to_string()
        } else {
            removed += 1;
            String::new()
        }
    });
    (out.into_owned(), removed)
}

/// Recover `(title, body)` pairs from the model's Markdown by splitting on
/// `## ` headings; a heading-free reply becomes one section titled after the
/// plan's first section.
fn split_sections(body: &str, planned: &[String]) -> Vec<ReportSection> {
    let mut sections: Vec<ReportSection> = Vec::new();
    let mut current_title: Option<String> = None;
    let mut current_body: Vec<&str> = Vec::new();

    let flush = |title: Option<String>, lines: &mut Vec<&str>, out: &mut Vec<ReportSection>| {
        let text = lines.join("\n").trim().to_string();
        lines.clear();
        if let Some(title) = title {
            out.push(ReportSection {
                title,
                markdown_body: text,
            });
        } else if !text.is_empty() {
            let fallback = planned
                .first()
                .cloned()
                .unwrap_or_else(|| "Overview".to_string());
            out.push(ReportSection {
                title: fallback,
                markdown_body: text,
            });
        }
    };

    for line in body.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            flush(current_title.take(), &mut current_body, &mut sections);
            current_title = Some(title.trim().to_string());
        } else {
            current_body.push(line);
        }
    }
    flush(current_title, &mut current_body, &mut sections);

    sections
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering & file output
// ─────────────────────────────────────────────────────────────────────────────

pub fn render_markdown(report: &Report, verification: Option<&VerificationSummary>) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Research Report: {}\n\n", report.query));
    out.push_str(&format!(
        "- Generated: {}\n- Intent: {}\n- Sources: {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.intent.as_str(),
        report.sources.len()
    ));
    for (key, value) in &report.metadata {
        out.push_str(&format!("- {}: {}\n", key, value));
    }
    out.push('\n');

    for section in &report.sections {
        out.push_str(&format!("## {}\n\n{}\n\n", section.title, section.markdown_body));
    }

    out.push_str("## Sources\n\n");
    for source in &report.sources {
        out.push_str(&format!(
            "{}. [{}]({})\n",
            source.number,
            if source.title.is_empty() { &source.url } else { &source.title },
            source.url
        ));
    }

    if !report.limitations.is_empty() {
        out.push_str("\n## Research Limitations\n\n");
        for gap in &report.limitations {
            out.push_str(&format!("- {}\n", gap));
        }
    }

    if let Some(v) = verification {
        out.push('\n');
        out.push_str(&render_verification(v));
    }

    out
}

fn render_verification(v: &VerificationSummary) -> String {
    let mut out = String::new();
    out.push_str("# Verification Report\n\n");
    out.push_str(&format!(
        "- Claims checked: {}\n- Supported: {}\n- Partial: {}\n- Unsupported: {}\n- Contradicted: {}\n- Unverifiable: {}\n",
        v.total, v.supported, v.partial, v.unsupported, v.contradicted, v.unverifiable
    ));
    if v.flagged.is_empty() {
        out.push_str("\nNo claims were flagged.\n");
    } else {
        out.push_str("\n## Flagged Claims\n\n");
        for f in &v.flagged {
            out.push_str(&format!(
                "- \"{}\": {:?} (confidence {:.2}) [{}]\n",
                f.claim_text,
                f.verdict,
                f.confidence,
                f.source_url
            ));
            if let Some(evidence) = &f.evidence {
                out.push_str(&format!("  - evidence: \"{}\"\n", evidence));
            }
        }
    }
    out
}

/// Write `report_YYYYMMDD_HHMMSS.md` (or `.txt`) under `output_dir` and
/// return the path.
pub fn write_report_file(
    output_dir: &Path,
    report: &Report,
    verification: Option<&VerificationSummary>,
    format: OutputFormat,
) -> PipelineResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let stamp = report.generated_at.format("%Y%m%d_%H%M%S");
    let (extension, contents) = match format {
        OutputFormat::Markdown => ("md", render_markdown(report, verification)),
        OutputFormat::Text => ("txt", strip_markdown(&render_markdown(report, verification))),
    };
    let path = output_dir.join(format!("report_{}.{}", stamp, extension));
    std::fs::write(&path, contents)?;

    info!(path = %path.display(), "report written");
    Ok(path)
}

/// Plain-text rendering: headings lose their `#` prefixes, emphasis markers
/// drop, links collapse to `text (url)`.
fn strip_markdown(md: &str) -> String {
    let heading = Regex::new(r"(?m)^#{1,6}\s*").expect("static regex");
    let link = Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("static regex");
    let out = heading.replace_all(md, "");
    let out = link.replace_all(&out, "$1 ($2)");
    out.replace("**", "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IntentKind;

    #[test]
    fn citation_validation_strips_out_of_range_markers() {
        let body = "HTTP/3 uses QUIC [Source 1]. It is fast [Source 7]. See [Source 2].";
        let (out, removed) = validate_citations(body, 2);
        assert_eq!(removed, 1);
        assert!(out.contains("[Source 1]"));
        assert!(out.contains("[Source 2]"));
        assert!(!out.contains("[Source 7]"));
    }

    #[test]
    fn sections_split_on_h2_headings() {
        let body = "## Overview\n\nIntro text [Source 1].\n\n## Details\n\nMore text.";
        let sections = split_sections(body, &["Overview".into(), "Details".into()]);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Overview");
        assert!(sections[0].markdown_body.contains("[Source 1]"));
        assert_eq!(sections[1].title, "Details");
    }

    #[test]
    fn heading_free_reply_becomes_single_planned_section() {
        let sections = split_sections("just a blob of text", &["Overview".into()]);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Overview");
    }

    #[test]
    fn rendered_markdown_has_sources_and_limitations() {
        let report = Report {
            query: "What is HTTP/3?".into(),
            intent: IntentKind::Informational,
            sections: vec![ReportSection {
                title: "Overview".into(),
                markdown_body: "HTTP/3 rides QUIC [Source 1].".into(),
            }],
            sources: vec![SourceRef {
                number: 1,
                url: "https://example.org/http3".into(),
                title: "HTTP/3 Explained".into(),
            }],
            generated_at: Utc::now(),
            limitations: vec!["No performance benchmarks found".into()],
            metadata: BTreeMap::new(),
        };
        let md = render_markdown(&report, None);
        assert!(md.starts_with("# Research Report: What is HTTP/3?"));
        assert!(md.contains("## Sources\n\n1. [HTTP/3 Explained](https://example.org/http3)"));
        assert!(md.contains("## Research Limitations"));
        assert!(!md.contains("# Verification Report"));
    }

    #[test]
    fn text_format_strips_markdown_scaffolding() {
        let stripped = strip_markdown("## Heading\n\nBody with [link](https://x.org) and **bold**.");
        assert!(stripped.contains("Heading"));
        assert!(!stripped.contains("##"));
        assert!(stripped.contains("link (https://x.org)"));
        assert!(!stripped.contains("**"));
    }
}
