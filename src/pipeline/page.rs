//! One page (or sheet) through repair, table extraction, mapping and
//! normalisation, producing its records and its [`PageReport`].

use crate::document::Sheet;
use crate::error::PageError;
use crate::output::{PageReport, PageStatus, PricelistRecord, RowRejection, TableReport};
use crate::pipeline::mapping::FieldMapping;
use crate::pipeline::normalize::{normalize_row, RowContext};
use crate::pipeline::repair::{repair, RepairStatus};
use crate::pipeline::table::{extract_sheet_table, extract_tables, Table};
use tracing::{debug, warn};

/// Records and annotation for one page.
#[derive(Debug, Clone)]
pub struct PageOutput {
    pub report: PageReport,
    pub records: Vec<PricelistRecord>,
}

/// Turn one page's raw model output into records.
pub fn from_model_output(
    raw: &str,
    file_name: &str,
    page: usize,
    mapping: &FieldMapping,
    attempts: u32,
) -> PageOutput {
    let repaired = repair(raw);
    let mut report = PageReport {
        page,
        sheet_name: None,
        status: PageStatus::Ok,
        tables: Vec::new(),
        records: 0,
        skipped_rows: 0,
        attempts,
        repair_passes: repaired.passes(),
        duration_ms: 0,
        error: None,
    };

    if let RepairStatus::Exhausted { passes } = repaired.status {
        let err = PageError::RepairExhausted {
            page,
            attempts: passes,
        };
        warn!("{err}");
        report.status = PageStatus::Partial;
        report.error = Some(err.detail());
        return PageOutput {
            report,
            records: Vec::new(),
        };
    }

    let tables = extract_tables(&repaired.cells);
    debug!(
        "Page {}: {} cells, {} tables",
        page,
        repaired.cells.len(),
        tables.len()
    );
    let ctx = RowContext {
        file_name,
        page,
        sheet_name: None,
        table_index: 0,
    };
    let (tables, records) = records_from_tables(&tables, mapping, ctx);
    report.skipped_rows = tables.iter().map(|t| t.skipped_rows).sum();
    report.records = records.len();
    report.tables = tables;
    PageOutput { report, records }
}

/// Turn one sheet into records; no inference involved.
pub fn from_sheet(sheet: &Sheet, file_name: &str, page: usize, mapping: &FieldMapping) -> PageOutput {
    let tables: Vec<Table> = extract_sheet_table(sheet).into_iter().collect();
    let ctx = RowContext {
        file_name,
        page,
        sheet_name: Some(&sheet.name),
        table_index: 0,
    };
    let (tables, records) = records_from_tables(&tables, mapping, ctx);
    debug!(
        "Sheet '{}': {} records from {} table(s)",
        sheet.name,
        records.len(),
        tables.len()
    );
    PageOutput {
        report: PageReport {
            page,
            sheet_name: Some(sheet.name.clone()),
            status: PageStatus::Ok,
            skipped_rows: tables.iter().map(|t| t.skipped_rows).sum(),
            records: records.len(),
            tables,
            attempts: 0,
            repair_passes: 0,
            duration_ms: 0,
            error: None,
        },
        records,
    }
}

/// Map and normalise every row of every table, in order.
fn records_from_tables(
    tables: &[Table],
    mapping: &FieldMapping,
    ctx: RowContext<'_>,
) -> (Vec<TableReport>, Vec<PricelistRecord>) {
    let mut reports = Vec::with_capacity(tables.len());
    let mut records = Vec::new();

    for table in tables {
        let header_mapping = mapping.map_headers(&table.headers);
        let ctx = RowContext {
            table_index: table.index,
            ..ctx
        };
        let mut report = TableReport {
            table_index: table.index,
            headers: table.headers.clone(),
            mapped: header_mapping.mapped(),
            unmapped_headers: header_mapping.unmapped_headers(),
            ..Default::default()
        };

        for (row_index, row) in table.rows.iter().enumerate() {
            match normalize_row(header_mapping.apply(row), row_index, &ctx) {
                Ok(record) => {
                    records.push(record);
                    report.rows_emitted += 1;
                }
                Err(reason) => {
                    debug!(
                        "Page {} table {} row {}: skipped ({})",
                        ctx.page, table.index, row_index, reason
                    );
                    report.skipped_rows += 1;
                    report.rejections.push(RowRejection { row_index, reason });
                }
            }
        }
        reports.push(report);
    }
    (reports, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MergeRange;
    use crate::error::ErrorKind;

    fn mapping() -> FieldMapping {
        FieldMapping::builtin().unwrap()
    }

    const PAGE: &str = r#"[
        {"bbox":[0,0,500,30],"category":"Title","text":"Toyota 2024"},
        {"bbox":[0,40,500,400],"category":"Table","text":"<table><tr><th>Model</th><th>Engine</th><th>Price (EUR)</th></tr><tr><td>Corolla</td><td>1.8 Hybrid</td><td>28.950</td></tr><tr><td>GR Yaris</td><td>1.6 Turbo</td><td>N/A</td></tr></table>"}
    ]"#;

    #[test]
    fn page_with_one_bad_row() {
        let out = from_model_output(PAGE, "toyota.pdf", 2, &mapping(), 1);
        assert_eq!(out.report.status, PageStatus::Ok);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.report.skipped_rows, 1);
        assert_eq!(out.report.tables[0].rejections[0].row_index, 1);
        let rec = &out.records[0];
        assert_eq!(rec.price.value, 28950.0);
        assert_eq!(rec.source.provenance(), (2, 0, 0));
        assert_eq!(rec.source.file_name, "toyota.pdf");
    }

    #[test]
    fn unrecoverable_output_is_partial() {
        let out = from_model_output("sorry, no tables", "a.pdf", 1, &mapping(), 1);
        assert_eq!(out.report.status, PageStatus::Partial);
        assert!(out.records.is_empty());
        assert_eq!(out.report.error.unwrap().kind, ErrorKind::RepairExhausted);
    }

    #[test]
    fn text_only_page_is_ok_with_no_records() {
        let out = from_model_output(
            r#"[{"category":"Text","text":"Terms and conditions"}]"#,
            "a.pdf",
            1,
            &mapping(),
            1,
        );
        assert_eq!(out.report.status, PageStatus::Ok);
        assert!(out.records.is_empty());
        assert!(out.report.tables.is_empty());
    }

    #[test]
    fn sheet_with_banner_and_footnote() {
        let s = |v: &str| Some(v.to_string());
        let sheet = Sheet {
            name: "Pricelist".into(),
            rows: vec![
                vec![s("Toyota Pricelist 2024")],
                vec![],
                vec![s("Model"), s("Engine"), s("Transmission"), s("Drivetrain"), s("Price (EUR)"), s("Doors")],
                vec![s("Corolla"), s("1.8 Hybrid"), s("e-CVT"), s("FWD"), s("28950"), s("5")],
                vec![s("RAV4"), s("2.5 Hybrid"), s("e-CVT"), s("AWD"), s("42500"), s("5")],
                vec![s("* All prices include 19% VAT")],
            ],
            merges: vec![
                MergeRange { first_row: 0, first_col: 0, last_row: 0, last_col: 5 },
                MergeRange { first_row: 5, first_col: 0, last_row: 5, last_col: 5 },
            ],
        };
        let out = from_sheet(&sheet, "toyota.xlsx", 1, &mapping());
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.report.skipped_rows, 1);
        assert_eq!(out.report.sheet_name.as_deref(), Some("Pricelist"));
        let corolla = &out.records[0];
        assert_eq!(corolla.model.as_deref(), Some("Corolla"));
        assert_eq!(corolla.price.value, 28950.0);
        assert_eq!(corolla.price.currency.as_deref(), Some("EUR"));
        assert_eq!(corolla.doors, Some(5));
        assert_eq!(corolla.drivetrain.as_deref(), Some("FWD"));
    }
}
