//! Output types: canonical pricelist records and the per-document result.
//!
//! A [`ParseResult`] is what a completed job serves: the ordered
//! [`PricelistRecord`] list plus one [`PageReport`] per attempted page so a
//! caller can see exactly which pages were `ok`, `partial` or `failed`, and
//! how many rows each table rejected.

use crate::document::DocumentKind;
use crate::error::ErrorDetail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine attributes of a vehicle row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub description: Option<String>,
    pub displacement: Option<String>,
    pub fuel_type: Option<String>,
    pub power_hp: Option<f64>,
    pub power_kw: Option<f64>,
}

impl Engine {
    pub fn is_empty(&self) -> bool {
        self == &Engine::default()
    }
}

/// Price of a vehicle row. `value` is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub value: f64,
    /// ISO 4217 code, when it could be read or inferred.
    pub currency: Option<String>,
    pub includes_tax: Option<bool>,
    pub tax_rate: Option<f64>,
}

/// One optional extra listed against a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionItem {
    pub name: String,
    pub code: Option<String>,
    pub price: Option<f64>,
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub file_name: String,
    /// 1-indexed page or sheet number.
    pub page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    /// 0-indexed table on the page.
    pub table_index: usize,
    /// 0-indexed data row in the table.
    pub row_index: usize,
}

impl Source {
    /// `(page, table_index, row_index)`; unique within a result.
    pub fn provenance(&self) -> (usize, usize, usize) {
        (self.page, self.table_index, self.row_index)
    }
}

/// One canonical, validated vehicle pricing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricelistRecord {
    pub make: Option<String>,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub trim: Option<String>,
    pub body_type: Option<String>,
    #[serde(default, skip_serializing_if = "Engine::is_empty")]
    pub engine: Engine,
    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    pub doors: Option<u32>,
    pub seats: Option<u32>,
    pub price: Price,
    pub msrp: Option<f64>,
    pub effective_date: Option<String>,
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionItem>,
    pub source: Source,
    /// Headers of this row that matched no mapping rule.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmapped: Vec<String>,
    /// Raw values of unmapped (or duplicate) columns, keyed by header.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Outcome of one page or sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    /// Output parsed (possibly after repair) and tables extracted.
    Ok,
    /// Model output unrecoverable; page contributes zero records.
    Partial,
    /// Backend failed after retry, or the page could not be prepared.
    Failed,
}

/// A row dropped by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    pub row_index: usize,
    pub reason: String,
}

/// Per-table summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableReport {
    pub table_index: usize,
    pub headers: Vec<String>,
    /// Header → canonical field path, for mapped headers only.
    pub mapped: BTreeMap<String, String>,
    pub unmapped_headers: Vec<String>,
    pub rows_emitted: usize,
    pub skipped_rows: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<RowRejection>,
}

/// Per-page annotation in a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    /// 1-indexed page or sheet number.
    pub page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    pub status: PageStatus,
    pub tables: Vec<TableReport>,
    pub records: usize,
    pub skipped_rows: usize,
    /// Backend attempts made for this page (0 for sheets).
    pub attempts: u32,
    /// Repair passes needed before the model output parsed.
    pub repair_passes: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl PageReport {
    pub fn failed(page: usize, sheet_name: Option<String>, error: ErrorDetail) -> Self {
        Self {
            page,
            sheet_name,
            status: PageStatus::Failed,
            tables: Vec::new(),
            records: 0,
            skipped_rows: 0,
            attempts: 0,
            repair_passes: 0,
            duration_ms: 0,
            error: Some(error),
        }
    }
}

/// Aggregate statistics for a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseStats {
    pub total_pages: usize,
    pub attempted_pages: usize,
    pub ok_pages: usize,
    pub partial_pages: usize,
    pub failed_pages: usize,
    pub tables: usize,
    pub records: usize,
    pub skipped_rows: usize,
    pub duration_ms: u64,
}

/// The payload of a completed (or cancelled) job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub file_name: String,
    pub kind: DocumentKind,
    /// Records in page order, then table order, then row order.
    pub records: Vec<PricelistRecord>,
    pub pages: Vec<PageReport>,
    pub stats: ParseStats,
}

impl ParseResult {
    pub fn page_statuses(&self) -> Vec<PageStatus> {
        self.pages.iter().map(|p| p.status).collect()
    }

    /// Build the result from page reports, computing statistics.
    pub(crate) fn assemble(
        file_name: String,
        kind: DocumentKind,
        total_pages: usize,
        records: Vec<PricelistRecord>,
        pages: Vec<PageReport>,
        duration_ms: u64,
    ) -> Self {
        let count = |s: PageStatus| pages.iter().filter(|p| p.status == s).count();
        let stats = ParseStats {
            total_pages,
            attempted_pages: pages.len(),
            ok_pages: count(PageStatus::Ok),
            partial_pages: count(PageStatus::Partial),
            failed_pages: count(PageStatus::Failed),
            tables: pages.iter().map(|p| p.tables.len()).sum(),
            records: records.len(),
            skipped_rows: pages.iter().map(|p| p.skipped_rows).sum(),
            duration_ms,
        };
        Self {
            file_name,
            kind,
            records,
            pages,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn report(page: usize, status: PageStatus, skipped: usize) -> PageReport {
        PageReport {
            page,
            sheet_name: None,
            status,
            tables: vec![TableReport::default()],
            records: 0,
            skipped_rows: skipped,
            attempts: 1,
            repair_passes: 0,
            duration_ms: 1,
            error: None,
        }
    }

    #[test]
    fn assemble_counts_statuses() {
        let pages = vec![
            report(1, PageStatus::Ok, 1),
            PageReport::failed(2, None, ErrorDetail::new(ErrorKind::BackendError, "down")),
            report(3, PageStatus::Partial, 0),
        ];
        let r = ParseResult::assemble("a.pdf".into(), DocumentKind::Pdf, 3, vec![], pages, 10);
        assert_eq!(r.stats.ok_pages, 1);
        assert_eq!(r.stats.failed_pages, 1);
        assert_eq!(r.stats.partial_pages, 1);
        assert_eq!(r.stats.skipped_rows, 1);
        assert_eq!(r.stats.tables, 2);
        assert_eq!(
            r.page_statuses(),
            vec![PageStatus::Ok, PageStatus::Failed, PageStatus::Partial]
        );
    }

    #[test]
    fn page_status_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&PageStatus::Partial).unwrap(), "\"partial\"");
    }
}
