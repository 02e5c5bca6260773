//! Table extraction: layout cells or sheet grids → header + data rows.
//!
//! Both sources are first flattened into a rectangular string grid in which
//! every merged region (HTML `rowspan`/`colspan`, sheet merge ranges) has
//! its origin value copied into each covered position. From there the two
//! paths share [`build_table`]:
//!
//! * the header is the leading `<thead>`/`<th>` block when the HTML has
//!   one, otherwise the first row with at least two distinct values, so a
//!   merged title banner never becomes the header;
//! * empty rows and columns are dropped, blank headers become `column_N`
//!   and repeats get a ` (2)` suffix;
//! * a table with no data rows is discarded.
//!
//! On a page, a table cell directly following another table (no text cell
//! in between) with an identical header row is a fragment of the same
//! table and its rows are appended.

use crate::document::Sheet;
use crate::pipeline::repair::{CellCategory, LayoutCell};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());

/// Merged regions larger than this are clamped.
const MAX_SPAN: usize = 1_000;

/// One extracted table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// 0-indexed position on the page, after fragment merging.
    pub index: usize,
    pub headers: Vec<String>,
    /// Data rows, each exactly `headers.len()` wide; position is the row index.
    pub rows: Vec<Vec<String>>,
    /// Top edge of the (first) source cell, for fragment ordering.
    top: Option<f64>,
}

/// A rectangular grid plus which leading rows the source marked as header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    pub rows: Vec<Vec<String>>,
    pub head_rows: usize,
}

// ── Page extraction ──────────────────────────────────────────────────────

/// Extract tables from one page's layout cells, in reading order.
pub fn extract_tables(cells: &[LayoutCell]) -> Vec<Table> {
    let mut tables: Vec<Table> = Vec::new();
    let mut text_since_table = true;

    for cell in cells {
        match cell.category {
            CellCategory::Text => text_since_table = true,
            CellCategory::Other => {}
            CellCategory::Table => {
                let top = cell.bbox.map(|b| b[1]);
                for grid in grids_from_cell_text(&cell.text) {
                    let Some((headers, rows)) = build_table(grid) else {
                        continue;
                    };
                    if let Some(prev) = tables.last_mut() {
                        let below = match (prev.top, top) {
                            (Some(p), Some(t)) => t >= p,
                            _ => true,
                        };
                        if !text_since_table && below && prev.headers == headers {
                            debug!(
                                "Merging {}-row fragment into table {}",
                                rows.len(),
                                prev.index
                            );
                            prev.rows.extend(rows);
                            continue;
                        }
                    }
                    tables.push(Table {
                        index: tables.len(),
                        headers,
                        rows,
                        top,
                    });
                    text_since_table = false;
                }
            }
        }
    }
    tables
}

/// One table per non-blank sheet.
pub fn extract_sheet_table(sheet: &Sheet) -> Option<Table> {
    let (headers, rows) = build_table(grid_from_sheet(sheet))?;
    Some(Table {
        index: 0,
        headers,
        rows,
        top: None,
    })
}

fn grids_from_cell_text(text: &str) -> Vec<Grid> {
    if text.contains("<table") || text.contains("<tr") {
        grids_from_html(text)
    } else {
        grid_from_markdown(text).into_iter().collect()
    }
}

// ── HTML ─────────────────────────────────────────────────────────────────

/// Flatten every `<table>` in an HTML fragment.
pub fn grids_from_html(html: &str) -> Vec<Grid> {
    let doc = Html::parse_fragment(html);
    doc.select(&TABLE)
        // Nested tables are flattened into their parent.
        .filter(|t| !t.ancestors().filter_map(ElementRef::wrap).any(|a| a.value().name() == "table"))
        .map(grid_from_table)
        .collect()
}

fn grid_from_table(table: ElementRef<'_>) -> Grid {
    let mut slots: Vec<Vec<Option<String>>> = Vec::new();
    let mut head_flags: Vec<bool> = Vec::new();

    for (r, tr) in table.select(&ROW).enumerate() {
        if slots.len() <= r {
            slots.resize_with(r + 1, Vec::new);
        }
        let cells: Vec<ElementRef<'_>> = tr
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|e| matches!(e.value().name(), "td" | "th"))
            .collect();
        let in_thead = tr
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| a.value().name() == "thead");
        let all_th = !cells.is_empty() && cells.iter().all(|c| c.value().name() == "th");
        head_flags.push(in_thead || all_th);

        let mut c = 0;
        for cell in cells {
            while slots[r].get(c).is_some_and(Option::is_some) {
                c += 1;
            }
            let text = cell_text(cell);
            let rowspan = span(cell, "rowspan");
            let colspan = span(cell, "colspan");
            for dr in 0..rowspan {
                let row = r + dr;
                if slots.len() <= row {
                    slots.resize_with(row + 1, Vec::new);
                }
                for dc in 0..colspan {
                    let col = c + dc;
                    if slots[row].len() <= col {
                        slots[row].resize(col + 1, None);
                    }
                    slots[row][col] = Some(text.clone());
                }
            }
            c += colspan;
        }
    }

    let head_rows = head_flags.iter().take_while(|&&h| h).count();
    Grid {
        rows: slots
            .into_iter()
            .map(|row| row.into_iter().map(Option::unwrap_or_default).collect())
            .collect(),
        head_rows,
    }
}

fn span(cell: ElementRef<'_>, attr: &str) -> usize {
    cell.value()
        .attr(attr)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_SPAN)
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Markdown ─────────────────────────────────────────────────────────────

/// Pipe tables, for models that ignore the HTML instruction.
fn grid_from_markdown(text: &str) -> Option<Grid> {
    let rows: Vec<Vec<String>> = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('|'))
        .filter(|l| !l.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ')))
        .map(|l| {
            l.trim_matches('|')
                .split('|')
                .map(|c| c.trim().to_string())
                .collect()
        })
        .collect();
    (!rows.is_empty()).then_some(Grid { rows, head_rows: 0 })
}

// ── Sheets ───────────────────────────────────────────────────────────────

/// Flatten a sheet, copying each merge origin into its region.
pub fn grid_from_sheet(sheet: &Sheet) -> Grid {
    let (height, width) = sheet.dimensions();

    let mut rows: Vec<Vec<String>> = sheet
        .rows
        .iter()
        .map(|row| {
            (0..width)
                .map(|c| {
                    row.get(c)
                        .and_then(|v| v.as_deref())
                        .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    for merge in &sheet.merges {
        // Regions reaching past the grid are cut at its edge.
        let Some(m) = merge.clamp_to(height, width) else {
            debug!("Sheet '{}': ignoring merge {:?}", sheet.name, merge);
            continue;
        };
        let origin = rows[m.first_row][m.first_col].clone();
        for row in &mut rows[m.first_row..=m.last_row] {
            for cell in &mut row[m.first_col..=m.last_col] {
                cell.clone_from(&origin);
            }
        }
    }
    Grid { rows, head_rows: 0 }
}

// ── Shared ───────────────────────────────────────────────────────────────

/// Pick the header and data rows of a grid. `None` if there is no data.
pub fn build_table(grid: Grid) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let Grid { rows, head_rows } = grid;
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return None;
    }
    let is_empty_row = |r: &Vec<String>| r.iter().all(|c| c.trim().is_empty());

    // Keep columns that hold anything at all.
    let keep: Vec<usize> = (0..width)
        .filter(|&c| rows.iter().any(|r| r.get(c).is_some_and(|v| !v.trim().is_empty())))
        .collect();
    let project = |r: &Vec<String>| -> Vec<String> {
        keep.iter()
            .map(|&c| r.get(c).map(|v| v.trim().to_string()).unwrap_or_default())
            .collect()
    };

    let (header_rows, data_start): (Vec<Vec<String>>, usize) = if head_rows > 0 {
        let head: Vec<Vec<String>> = rows[..head_rows].iter().map(project).collect();
        let informative: Vec<Vec<String>> =
            head.iter().filter(|r| distinct(r) >= 2).cloned().collect();
        let head = if informative.is_empty() { head } else { informative };
        (head, head_rows)
    } else {
        let min_distinct = if keep.len() == 1 { 1 } else { 2 };
        let idx = rows
            .iter()
            .position(|r| distinct(&project(r)) >= min_distinct)?;
        (vec![project(&rows[idx])], idx + 1)
    };

    let data: Vec<Vec<String>> = rows[data_start..]
        .iter()
        .filter(|r| !is_empty_row(r))
        .map(project)
        .filter(|r| !r.iter().all(String::is_empty))
        .collect();
    if data.is_empty() {
        return None;
    }
    Some((header_names(&header_rows, keep.len()), data))
}

fn distinct(row: &[String]) -> usize {
    row.iter()
        .filter(|v| !v.is_empty())
        .collect::<HashSet<_>>()
        .len()
}

/// Join stacked header rows per column and make the names unique.
fn header_names(header_rows: &[Vec<String>], width: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    (0..width)
        .map(|c| {
            let mut parts: Vec<&str> = Vec::new();
            for row in header_rows {
                let part = row[c].as_str();
                if !part.is_empty() && parts.last() != Some(&part) {
                    parts.push(part);
                }
            }
            let base = if parts.is_empty() {
                format!("column_{}", c + 1)
            } else {
                parts.join(" ")
            };
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.clone()) {
                name = format!("{base} ({n})");
                n += 1;
            }
            name
        })
        .collect()
}
