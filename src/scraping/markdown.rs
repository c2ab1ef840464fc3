//! HTML → Markdown conversion for the primary scrape tier.
//!
//! Readability isolates the article body and `html2md` renders it; pipe
//! tables are carved out of the raw HTML *before* that pass by a
//! deterministic converter, parked behind placeholders, and substituted back
//! afterwards so readability's pruning cannot mangle them.

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

/// Cell text longer than this is truncated with a trailing ellipsis.
const MAX_CELL_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub markdown: String,
    pub title: String,
    pub tables_found: usize,
    pub tables_converted: usize,
}

pub fn html_to_markdown(html: &str, base_url: &Url, preserve_tables: bool) -> ConversionOutcome {
    let title = extract_title(html);

    let (prepared, tables) = if preserve_tables {
        carve_out_tables(html)
    } else {
        (html.to_string(), Vec::new())
    };
    let tables_found = tables.len();

    let body = extract_body_markdown(&prepared, base_url);

    let (markdown, tables_converted) = substitute_tables(body, &tables);

    ConversionOutcome {
        markdown: post_clean(&markdown),
        title,
        tables_found,
        tables_converted,
    }
}

fn extract_title(html: &str) -> String {
    let doc = Html::parse_document(html);
    for css in ["title", "h1"] {
        if let Ok(sel) = Selector::parse(css) {
            if let Some(node) = doc.select(&sel).next() {
                let text = node.text().collect::<Vec<_>>().join(" ");
                let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !trimmed.is_empty() {
                    return trimmed;
                }
            }
        }
    }
    String::new()
}

/// Readability pass, falling back to a whole-document conversion when the
/// extractor rejects the page.
fn extract_body_markdown(html: &str, base_url: &Url) -> String {
    match readability::extractor::extract(&mut html.as_bytes(), base_url) {
        Ok(product) => html2md::parse_html(&product.content),
        Err(e) => {
            warn!("readability extraction failed ({}), converting whole document", e);
            html2md::parse_html(html)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Table carving
// ─────────────────────────────────────────────────────────────────────────────

/// Replace each outermost `<table>…</table>` span in the raw HTML with a
/// placeholder paragraph and return the converted pipe tables alongside.
/// Inner (nested) tables are flattened into their parent's cell text.
fn carve_out_tables(html: &str) -> (String, Vec<Option<String>>) {
    let spans = outermost_table_spans(html);
    if spans.is_empty() {
        return (html.to_string(), Vec::new());
    }

    let mut out = String::with_capacity(html.len());
    let mut tables = Vec::with_capacity(spans.len());
    let mut cursor = 0;

    for (i, &(start, end)) in spans.iter().enumerate() {
        out.push_str(&html[cursor..start]);
        out.push_str(&format!("<p>@@DOSSIER-TABLE-{}@@</p>", i));
        tables.push(convert_table_fragment(&html[start..end]));
        cursor = end;
    }
    out.push_str(&html[cursor..]);

    debug!(tables = tables.len(), "carved tables out of HTML");
    (out, tables)
}

/// Byte spans of outermost tables, matched by a depth count over
/// case-insensitive `<table` / `</table>` markers.
fn outermost_table_spans(html: &str) -> Vec<(usize, usize)> {
    let lower = html.to_lowercase();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut open_start = 0usize;
    let mut pos = 0usize;

    while pos < lower.len() {
        let next_open = lower[pos..].find("<table");
        let next_close = lower[pos..].find("</table");

        match (next_open, next_close) {
            (Some(o), Some(c)) if o < c => {
                if depth == 0 {
                    open_start = pos + o;
                }
                depth += 1;
                pos += o + "<table".len();
            }
            (_, Some(c)) => {
                let close_end = match lower[pos + c..].find('>') {
                    Some(g) => pos + c + g + 1,
                    None => lower.len(),
                };
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push((open_start, close_end));
                    }
                }
                pos = close_end;
            }
            (Some(o), None) => {
                // Unclosed table: stop scanning rather than guessing.
                pos += o + "<table".len();
            }
            (None, None) => break,
        }
    }

    spans
}

/// Deterministic `<table>` → pipe-table conversion: header row first (th
/// cells, else the first row), then data rows. Inline links survive as
/// `[text](href)`; cell text is whitespace-normalized, pipe-escaped, trimmed,
/// and truncated at 200 chars with an ellipsis.
fn convert_table_fragment(table_html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(table_html);
    let tr_sel = Selector::parse("tr").ok()?;
    let th_sel = Selector::parse("th").ok()?;
    let td_sel = Selector::parse("td").ok()?;

    let mut header: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();

    for tr in fragment.select(&tr_sel) {
        let ths: Vec<String> = tr.select(&th_sel).map(|c| render_cell(&c.inner_html())).collect();
        let tds: Vec<String> = tr.select(&td_sel).map(|c| render_cell(&c.inner_html())).collect();

        if header.is_empty() && !ths.is_empty() {
            header = ths;
            // A row mixing th + td (row-header tables) keeps the td part as data.
            if !tds.is_empty() {
                rows.push(tds);
            }
            continue;
        }

        let cells = if tds.is_empty() { ths } else { tds };
        if !cells.is_empty() {
            rows.push(cells);
        }
    }

    if header.is_empty() {
        if rows.is_empty() {
            return None;
        }
        header = rows.remove(0);
    }

    let width = header.len();
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("|{}", " --- |".repeat(width)));

    for mut row in rows {
        row.resize(width, String::new());
        row.truncate(width);
        lines.push(format!("| {} |", row.join(" | ")));
    }

    Some(lines.join("\n"))
}

/// Render one cell's inner HTML: anchors become Markdown links, every other
/// tag is stripped, entities are decoded, whitespace collapses.
fn render_cell(inner_html: &str) -> String {
    let link_re = Regex::new(r#"(?is)<a\b[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
        .expect("static regex");
    let linked = link_re.replace_all(inner_html, |caps: &regex::Captures<'_>| {
        let text = normalize_ws(&strip_tags(&caps[2]));
        if text.is_empty() {
            String::new()
        } else {
            format!("[{}]({})", text, &caps[1])
        }
    });

    let text = normalize_ws(&strip_tags(&linked)).replace('|', "\\|");
    truncate_cell(&text)
}

fn strip_tags(s: &str) -> String {
    let tag_re = Regex::new(r"(?s)<[^>]*>").expect("static regex");
    let stripped = tag_re.replace_all(s, " ");
    decode_entities(&stripped)
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_cell(s: &str) -> String {
    if s.chars().count() <= MAX_CELL_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CELL_CHARS).collect();
    out.push('…');
    out
}

/// Swap placeholders back for pipe tables. A placeholder readability dropped
/// gets its table appended at the end instead, so no converted table is lost.
fn substitute_tables(body: String, tables: &[Option<String>]) -> (String, usize) {
    let mut out = body;
    let mut converted = 0usize;
    let mut orphans: Vec<&str> = Vec::new();

    for (i, table) in tables.iter().enumerate() {
        let placeholder = format!("@@DOSSIER-TABLE-{}@@", i);
        match table {
            Some(md) => {
                converted += 1;
                if out.contains(&placeholder) {
                    out = out.replace(&placeholder, &format!("\n\n{}\n\n", md));
                } else {
                    orphans.push(md);
                }
            }
            None => {
                // Unconvertible table (e.g., no rows): drop the placeholder.
                out = out.replace(&placeholder, "");
            }
        }
    }

    for md in orphans {
        out.push_str("\n\n");
        out.push_str(md);
    }

    (out, converted)
}

fn post_clean(s: &str) -> String {
    let collapsed = Regex::new(r"\n{3,}")
        .expect("static regex")
        .replace_all(s, "\n\n");
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarize::tables::parse_pipe_tables;

    fn page(body: &str) -> String {
        format!(
            "<html><head><title>Benchmarks 2026</title></head><body>\
             <article><h1>Benchmarks</h1><p>{}</p>{}</article></body></html>",
            "Context paragraph with enough words to keep readability interested in the article body. "
                .repeat(8),
            body
        )
    }

    const TABLE: &str = "<table>\
        <tr><th>Model</th><th>Accuracy</th></tr>\
        <tr><td>alpha</td><td>0.91</td></tr>\
        <tr><td>beta</td><td>0.87</td></tr>\
        <tr><td>gamma</td><td>0.79</td></tr>\
        </table>";

    #[test]
    fn table_survives_conversion_and_reparses() {
        let html = page(TABLE);
        let base = Url::parse("https://example.org/bench").unwrap();
        let outcome = html_to_markdown(&html, &base, true);

        assert_eq!(outcome.tables_found, 1);
        assert_eq!(outcome.tables_converted, 1);
        assert_eq!(outcome.title, "Benchmarks 2026");

        // Round-trip: the emitted pipe table parses back with the same
        // header and row count.
        let parsed = parse_pipe_tables(&outcome.markdown);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].table.header, vec!["Model", "Accuracy"]);
        assert_eq!(parsed[0].table.rows.len(), 3);
    }

    #[test]
    fn inline_links_preserved_in_cells() {
        let table = "<table><tr><th>Project</th></tr>\
            <tr><td><a href=\"https://example.org/a\">Alpha</a> release</td></tr></table>";
        let md = convert_table_fragment(table).unwrap();
        assert!(md.contains("[Alpha](https://example.org/a) release"), "{md}");
    }

    #[test]
    fn long_cells_truncate_with_ellipsis() {
        let long = "x".repeat(300);
        let table = format!("<table><tr><th>A</th></tr><tr><td>{}</td></tr></table>", long);
        let md = convert_table_fragment(&table).unwrap();
        let cell_line = md.lines().nth(2).unwrap();
        assert!(cell_line.contains('…'));
        assert!(cell_line.chars().count() < 220);
    }

    #[test]
    fn nested_tables_flatten_into_outer_cells() {
        let nested = "<table><tr><th>Outer</th></tr>\
            <tr><td><table><tr><td>inner text</td></tr></table></td></tr></table>";
        let html = page(nested);
        let spans = outermost_table_spans(&html);
        assert_eq!(spans.len(), 1);
        let md = convert_table_fragment(&html[spans[0].0..spans[0].1]).unwrap();
        assert!(md.contains("inner text"));
        // Exactly one pipe table came out.
        assert_eq!(parse_pipe_tables(&md).len(), 1);
    }

    #[test]
    fn headerless_table_promotes_first_row() {
        let table = "<table><tr><td>a</td><td>b</td></tr><tr><td>1</td><td>2</td></tr></table>";
        let md = convert_table_fragment(table).unwrap();
        let parsed = parse_pipe_tables(&md);
        assert_eq!(parsed[0].table.header, vec!["a", "b"]);
        assert_eq!(parsed[0].table.rows.len(), 1);
    }

    #[test]
    fn pipe_characters_in_cells_are_escaped() {
        let table = "<table><tr><th>Expr</th></tr><tr><td>a | b</td></tr></table>";
        let md = convert_table_fragment(table).unwrap();
        assert!(md.contains("a \\| b"));
    }

    #[test]
    fn preserve_tables_off_skips_carving() {
        let html = page(TABLE);
        let base = Url::parse("https://example.org/bench").unwrap();
        let outcome = html_to_markdown(&html, &base, false);
        assert_eq!(outcome.tables_found, 0);
        assert_eq!(outcome.tables_converted, 0);
    }
}
