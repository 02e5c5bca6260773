//! Repair: raw model text → ordered layout cells.
//!
//! The model is asked for a JSON array of `{bbox, category, text}` cells but
//! routinely hands back something close to it instead: wrapped in a code
//! fence, followed by commentary, cut off mid-string when it hit the token
//! cap, with trailing commas or Python literals. Strict parsing is tried
//! first; after that at most [`MAX_REPAIR_PASSES`] cumulative passes run,
//! each one more lossy than the last:
//!
//! 1. close an open string and every open bracket, dropping stray closers
//!    and dangling commas
//! 2. rewrite `None`/`True`/`False` and trailing commas outside strings
//! 3. cut back to the last complete top-level element
//!
//! Valid input comes back unchanged, so repairing an already repaired
//! answer is a no-op.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Upper bound on repair passes per page.
pub const MAX_REPAIR_PASSES: u32 = 3;

/// Coarse category of a layout cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellCategory {
    Table,
    /// Running text of any kind: paragraphs, titles, captions, list items.
    Text,
    /// Pictures, formulas, page headers and footers.
    Other,
}

impl CellCategory {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "table" => CellCategory::Table,
            "text" | "title" | "section-header" | "list-item" | "caption" | "footnote" => {
                CellCategory::Text
            }
            _ => CellCategory::Other,
        }
    }
}

/// One element of the model's page layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutCell {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    /// Category label exactly as the model wrote it.
    #[serde(rename = "category")]
    pub label: String,
    #[serde(skip)]
    pub category: CellCategory,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    /// Parsed without modification.
    Clean,
    /// Parsed after this many passes.
    Repaired { passes: u32 },
    /// Nothing usable after every pass.
    Exhausted { passes: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub cells: Vec<LayoutCell>,
    pub status: RepairStatus,
}

impl RepairOutcome {
    pub fn passes(&self) -> u32 {
        match self.status {
            RepairStatus::Clean => 0,
            RepairStatus::Repaired { passes } | RepairStatus::Exhausted { passes } => passes,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.status, RepairStatus::Exhausted { .. })
    }
}

/// Turn raw model output into layout cells.
///
/// Each opening bracket is a possible start of the answer. The first one
/// yielding at least one cell wins; bracketed prose such as `Page [1]`
/// comes out empty and is skipped.
pub fn repair(raw: &str) -> RepairOutcome {
    let candidates = json_candidates(raw);
    if candidates.is_empty() {
        debug!("No JSON found in {} chars of model output", raw.len());
        return exhausted();
    }

    let mut fallback = None;
    for candidate in &candidates {
        let outcome = repair_candidate(candidate);
        if !outcome.cells.is_empty() {
            return outcome;
        }
        if fallback.is_none() && !outcome.is_exhausted() {
            fallback = Some(outcome);
        }
    }
    fallback.unwrap_or_else(exhausted)
}

fn exhausted() -> RepairOutcome {
    RepairOutcome {
        cells: Vec::new(),
        status: RepairStatus::Exhausted {
            passes: MAX_REPAIR_PASSES,
        },
    }
}

fn repair_candidate(candidate: &str) -> RepairOutcome {
    if let Some(cells) = parse_leading(candidate).and_then(cells_from_value) {
        return RepairOutcome {
            cells,
            status: RepairStatus::Clean,
        };
    }

    for pass in 1..=MAX_REPAIR_PASSES {
        let text = match pass {
            1 => close_structure(candidate),
            2 => normalise_literals(&close_structure(candidate)),
            // Cut on the unclosed text: a closed-up trailing fragment
            // would otherwise count as complete.
            _ => match last_complete_elements(&normalise_literals(candidate)) {
                Some(t) => close_structure(&t),
                None => break,
            },
        };
        if let Some(cells) = parse_leading(&text).and_then(cells_from_value) {
            debug!("Model output repaired after {} pass(es)", pass);
            return RepairOutcome {
                cells,
                status: RepairStatus::Repaired { passes: pass },
            };
        }
    }
    exhausted()
}

// ── Locating the JSON ────────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n(.*?)\n?```").unwrap());
static RE_OPEN_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[A-Za-z]*[ \t]*\n").unwrap());

/// Upper bound on start positions tried per answer.
const MAX_CANDIDATES: usize = 16;

/// Strip code fences, then cut the text at each of its first opening
/// brackets. A candidate starting with an object is wrapped into an array.
fn json_candidates(raw: &str) -> Vec<String> {
    let trimmed = raw.trim().trim_start_matches('\u{feff}');
    let unfenced = if let Some(caps) = RE_FENCED.captures(trimmed) {
        caps[1].to_string()
    } else {
        // A truncated answer loses its closing fence.
        RE_OPEN_FENCE.replace(trimmed, "").to_string()
    };
    unfenced
        .match_indices(['[', '{'])
        .take(MAX_CANDIDATES)
        .map(|(start, open)| {
            let body = &unfenced[start..];
            if open == "{" {
                format!("[{body}")
            } else {
                body.to_string()
            }
        })
        .collect()
}

/// Parse the first JSON value, ignoring anything after it.
fn parse_leading(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

// ── Pass 1: close the structure ──────────────────────────────────────────

fn close_structure(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {}
                c => out.push(c),
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '[' | '{' => {
                stack.push(ch);
                out.push(ch);
            }
            ']' | '}' => {
                let opener = if ch == ']' { '[' } else { '{' };
                if stack.last() == Some(&opener) {
                    stack.pop();
                    trim_trailing_comma(&mut out);
                    out.push(ch);
                    if stack.is_empty() {
                        break;
                    }
                }
            }
            c => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    trim_trailing_comma(&mut out);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(open) = stack.pop() {
        trim_trailing_comma(&mut out);
        out.push(if open == '[' { ']' } else { '}' });
    }
    out
}

fn trim_trailing_comma(out: &mut String) {
    let len = out.trim_end().len();
    out.truncate(len);
    if out.ends_with(',') {
        out.pop();
        let len = out.trim_end().len();
        out.truncate(len);
    }
}

// ── Pass 2: literals and commas ──────────────────────────────────────────

/// Rewrite Python literals and drop commas before closers, outside strings.
fn normalise_literals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut word = String::new();

    let flush = |word: &mut String, out: &mut String| {
        match word.as_str() {
            "None" => out.push_str("null"),
            "True" => out.push_str("true"),
            "False" => out.push_str("false"),
            w => out.push_str(w),
        }
        word.clear();
    };

    for ch in s.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch.is_ascii_alphabetic() {
            word.push(ch);
            continue;
        }
        flush(&mut word, &mut out);
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ']' | '}' => {
                trim_trailing_comma(&mut out);
                out.push(ch);
            }
            c => out.push(c),
        }
    }
    flush(&mut word, &mut out);
    out
}

// ── Pass 3: last complete element ────────────────────────────────────────

/// Keep the top-level array up to its last complete element.
fn last_complete_elements(s: &str) -> Option<String> {
    if !s.starts_with('[') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut cut = None;

    for (i, ch) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    cut = Some(i + ch.len_utf8());
                }
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    cut.map(|end| format!("{}]", &s[..end]))
}

// ── Value → cells ────────────────────────────────────────────────────────

fn cells_from_value(value: Value) -> Option<Vec<LayoutCell>> {
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return None,
    };
    Some(items.into_iter().filter_map(cell_from_value).collect())
}

fn cell_from_value(value: Value) -> Option<LayoutCell> {
    let Value::Object(obj) = value else {
        return None;
    };
    let text = match obj.get("text") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let label = match obj.get("category").and_then(Value::as_str) {
        Some(l) => l.to_string(),
        None if text.contains("<table") => "Table".to_string(),
        None => "Text".to_string(),
    };
    let bbox = obj
        .get("bbox")
        .and_then(Value::as_array)
        .filter(|b| b.len() == 4)
        .and_then(|b| {
            let v: Vec<f64> = b.iter().filter_map(Value::as_f64).collect();
            (v.len() == 4).then(|| [v[0], v[1], v[2], v[3]])
        });
    Some(LayoutCell {
        bbox,
        category: CellCategory::from_label(&label),
        label,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"[{"bbox":[10,20,300,40],"category":"Title","text":"Toyota 2024"},{"bbox":[10,50,600,400],"category":"Table","text":"<table><tr><td>Model</td></tr></table>"}]"#;

    #[test]
    fn valid_input_is_clean() {
        let out = repair(VALID);
        assert_eq!(out.status, RepairStatus::Clean);
        assert_eq!(out.cells.len(), 2);
        assert_eq!(out.cells[0].category, CellCategory::Text);
        assert_eq!(out.cells[1].category, CellCategory::Table);
        assert_eq!(out.cells[1].bbox, Some([10.0, 50.0, 600.0, 400.0]));
    }

    #[test]
    fn fenced_with_commentary_is_clean() {
        let raw = format!("Here you go:\n```json\n{VALID}\n```\nLet me know!");
        let out = repair(&raw);
        assert_eq!(out.status, RepairStatus::Clean);
        assert_eq!(out.cells.len(), 2);
    }

    #[test]
    fn truncated_string_is_closed() {
        let raw = r#"[{"category":"Text","text":"Prices valid from"},{"category":"Table","text":"<table><tr><td>Corolla"#;
        let out = repair(raw);
        assert_eq!(out.status, RepairStatus::Repaired { passes: 1 });
        assert_eq!(out.cells.len(), 2);
        assert!(out.cells[1].text.ends_with("Corolla"));
    }

    #[test]
    fn truncated_key_falls_back_to_last_complete_element() {
        let raw = r#"[{"category":"Table","text":"<table></table>"},{"category":"Text","te"#;
        let out = repair(raw);
        assert_eq!(out.status, RepairStatus::Repaired { passes: 3 });
        assert_eq!(out.cells.len(), 1);
        assert_eq!(out.cells[0].category, CellCategory::Table);
    }

    #[test]
    fn python_literals_and_trailing_commas() {
        let raw = r#"[{"category":"Picture","text":None,},]"#;
        let out = repair(raw);
        assert!(!out.is_exhausted());
        assert_eq!(out.cells[0].category, CellCategory::Other);
        assert_eq!(out.cells[0].text, "");
    }

    #[test]
    fn raw_newlines_inside_strings() {
        let raw = "[{\"category\":\"Text\",\"text\":\"line one\nline two\"}]";
        let out = repair(raw);
        assert!(!out.is_exhausted());
        assert_eq!(out.cells[0].text, "line one\nline two");
    }

    #[test]
    fn bare_object_is_wrapped() {
        let out = repair(r#"{"category":"table","text":"<table></table>"}"#);
        assert_eq!(out.cells.len(), 1);
        assert_eq!(out.cells[0].category, CellCategory::Table);
    }

    #[test]
    fn empty_array_is_clean_with_no_cells() {
        let out = repair("[]");
        assert_eq!(out.status, RepairStatus::Clean);
        assert!(out.cells.is_empty());
    }

    #[test]
    fn bracketed_prose_before_the_answer_is_skipped() {
        for prefix in ["Page [1] of the pricelist:\n", "Prices in [EUR]:\n"] {
            let out = repair(&format!("{prefix}{VALID}"));
            assert!(!out.is_exhausted(), "prefix: {prefix}");
            assert_eq!(out.cells.len(), 2, "prefix: {prefix}");
            assert_eq!(out.cells[1].category, CellCategory::Table);
        }
    }

    #[test]
    fn object_inside_broken_wrapper_is_recovered() {
        let out = repair(r#"Result: [[ {"category":"Table","text":"<table></table>"} ]] ]]"#);
        assert_eq!(out.cells.len(), 1);
        assert_eq!(out.cells[0].category, CellCategory::Table);
    }

    #[test]
    fn prose_is_exhausted() {
        let out = repair("I cannot read this image.");
        assert!(out.is_exhausted());
        assert_eq!(out.passes(), MAX_REPAIR_PASSES);
        assert!(out.cells.is_empty());
    }

    #[test]
    fn repair_is_idempotent() {
        let inputs = [
            VALID.to_string(),
            r#"[{"category":"Table","text":"<table><tr><td>A"#.to_string(),
            r#"```json
[{"category":"Text","text":"x"},{"cat"#
                .to_string(),
        ];
        for raw in inputs {
            let first = repair(&raw);
            let reserialised = serde_json::to_string(&first.cells).unwrap();
            let second = repair(&reserialised);
            assert_eq!(second.status, RepairStatus::Clean, "input: {raw}");
            assert_eq!(first.cells, second.cells, "input: {raw}");
        }
    }

    #[test]
    fn category_labels() {
        assert_eq!(CellCategory::from_label("Section-header"), CellCategory::Text);
        assert_eq!(CellCategory::from_label("TABLE"), CellCategory::Table);
        assert_eq!(CellCategory::from_label("Page-footer"), CellCategory::Other);
    }
}
