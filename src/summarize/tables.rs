//! Markdown pipe-table parsing and deterministic compaction.
//!
//! Compaction keeps the header, selects the top-K rows by the strongest
//! numeric column (highest numeric density, leftmost on ties), and appends an
//! aggregate note computed in-process. No model ever sees the full table, and
//! no model ever computes the aggregates.

use crate::core::types::{CompactedTable, MarkdownTable};

/// A pipe table located in a Markdown document, with its line span.
#[derive(Debug, Clone)]
pub struct ParsedTable {
    /// First line of the table (header row), 0-based.
    pub start_line: usize,
    /// One past the last table line.
    pub end_line: usize,
    pub table: MarkdownTable,
}

#[derive(Debug, Clone, Copy)]
pub struct TablePolicy {
    pub topk_rows: usize,
    pub max_rows_verbatim: usize,
    pub max_cols_verbatim: usize,
}

impl Default for TablePolicy {
    fn default() -> Self {
        Self {
            topk_rows: 10,
            max_rows_verbatim: 15,
            max_cols_verbatim: 8,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Find every pipe table: a `|`-prefixed header line followed by a separator
/// line (dashes), then zero or more `|`-prefixed rows.
pub fn parse_pipe_tables(markdown: &str) -> Vec<ParsedTable> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut tables = Vec::new();
    let mut i = 0;

    while i + 1 < lines.len() {
        if !is_table_line(lines[i]) || !is_separator_line(lines[i + 1]) {
            i += 1;
            continue;
        }

        let header = parse_row(lines[i]);
        if header.is_empty() {
            i += 1;
            continue;
        }

        let start = i;
        let mut end = i + 2;
        let mut rows = Vec::new();
        while end < lines.len() && is_table_line(lines[end]) && !is_separator_line(lines[end]) {
            let row = parse_row(lines[end]);
            if !row.is_empty() {
                rows.push(row);
            }
            end += 1;
        }

        tables.push(ParsedTable {
            start_line: start,
            end_line: end,
            table: MarkdownTable { header, rows },
        });
        i = end;
    }

    tables
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_separator_line(line: &str) -> bool {
    let t = line.trim();
    if !t.starts_with('|') || !t.contains('-') {
        return false;
    }
    t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Split a table line into cells, honoring `\|` escapes and dropping the
/// empty fragments produced by the outer pipes.
fn parse_row(line: &str) -> Vec<String> {
    let t = line.trim();
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = t.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => {
                cells.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());

    // Outer pipes leave empty first/last fragments.
    if cells.first().is_some_and(|c| c.is_empty()) {
        cells.remove(0);
    }
    if cells.last().is_some_and(|c| c.is_empty()) {
        cells.pop();
    }
    cells
}

// ─────────────────────────────────────────────────────────────────────────────
// Compaction
// ─────────────────────────────────────────────────────────────────────────────

/// Numeric value of a cell, tolerating `%`, `$`, thousands separators, and
/// surrounding whitespace.
fn parse_numeric(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .trim()
        .trim_start_matches('$')
        .trim_end_matches('%')
        .replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Fraction of rows whose cell in `col` is numeric.
fn numeric_density(table: &MarkdownTable, col: usize) -> f64 {
    if table.rows.is_empty() {
        return 0.0;
    }
    let numeric = table
        .rows
        .iter()
        .filter(|r| r.get(col).map(String::as_str).and_then(parse_numeric).is_some())
        .count();
    numeric as f64 / table.rows.len() as f64
}

/// The column compaction sorts by: highest numeric density, leftmost on ties.
fn strongest_numeric_column(table: &MarkdownTable) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for col in 0..table.cols() {
        let density = numeric_density(table, col);
        if density <= 0.0 {
            continue;
        }
        match best {
            // Strictly-greater keeps the leftmost column on exact ties.
            Some((_, best_density)) if density <= best_density => {}
            _ => best = Some((col, density)),
        }
    }
    best.map(|(col, _)| col)
}

/// Deterministic compaction: header + top-K rows by the strongest numeric
/// column (value descending, original row index ascending on ties) + an
/// aggregate note. Aggregates cover every numeric cell in the column, not
/// just the rows shown.
pub fn compact_table(table: &MarkdownTable, topk_rows: usize) -> CompactedTable {
    let total = table.rows.len();

    let Some(col) = strongest_numeric_column(table) else {
        // No numeric column: keep the first K rows in order.
        let shown = topk_rows.min(total);
        let note = format!("{}/{} rows shown; selection=first rows (no numeric column)", shown, total);
        return CompactedTable {
            header: table.header.clone(),
            rows: table.rows.iter().take(shown).cloned().collect(),
            note,
        };
    };

    let col_name = table
        .header
        .get(col)
        .cloned()
        .unwrap_or_else(|| format!("col{}", col));

    let mut indexed: Vec<(usize, Option<f64>)> = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, r)| (i, r.get(col).map(String::as_str).and_then(parse_numeric)))
        .collect();

    // Numeric rows first by value descending; non-numeric rows last; ties
    // broken by original row index ascending.
    indexed.sort_by(|(ai, av), (bi, bv)| {
        match (av, bv) {
            (Some(a), Some(b)) => b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then(ai.cmp(bi))
    });

    let shown = topk_rows.min(total);
    let rows: Vec<Vec<String>> = indexed
        .iter()
        .take(shown)
        .map(|(i, _)| table.rows[*i].clone())
        .collect();

    let values: Vec<f64> = indexed.iter().filter_map(|(_, v)| *v).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);

    let note = format!(
        "{}/{} rows shown; selection=max by {}; {}: mean={}, max={}, min={}",
        shown,
        total,
        col_name,
        col_name,
        format_num(mean),
        format_num(max),
        format_num(min),
    );

    CompactedTable {
        header: table.header.clone(),
        rows,
        note,
    }
}

fn format_num(v: f64) -> String {
    let s = format!("{:.4}", v);
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Document-level preprocessing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TableOutcome {
    pub preserved: Vec<MarkdownTable>,
    pub compacted: Vec<CompactedTable>,
}

/// Replace every large table in `content` with its compacted form + note;
/// small tables stay verbatim. Returns the rewritten content and what was
/// kept / compacted.
pub fn preprocess_tables(content: &str, policy: &TablePolicy) -> (String, TableOutcome) {
    let parsed = parse_pipe_tables(content);
    if parsed.is_empty() {
        return (content.to_string(), TableOutcome::default());
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut outcome = TableOutcome::default();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut cursor = 0;

    for p in &parsed {
        for line in &lines[cursor..p.start_line] {
            out.push((*line).to_string());
        }

        let small = p.table.rows.len() <= policy.max_rows_verbatim
            && p.table.cols() <= policy.max_cols_verbatim;
        if small {
            for line in &lines[p.start_line..p.end_line] {
                out.push((*line).to_string());
            }
            outcome.preserved.push(p.table.clone());
        } else {
            let compacted = compact_table(&p.table, policy.topk_rows);
            out.push(render_table(&compacted.header, &compacted.rows));
            out.push(compacted.note.clone());
            outcome.compacted.push(compacted);
        }
        cursor = p.end_line;
    }

    for line in &lines[cursor..] {
        out.push((*line).to_string());
    }

    (out.join("\n"), outcome)
}

pub fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!("|{}", " --- |".repeat(header.len())));
    for row in rows {
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines.join("\n")
}
