//! Pipeline stages from model output (or sheet grid) to records.
//!
//! Each submodule implements exactly one transformation step and is
//! testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//!  raw text ──▶ repair ──▶ table ──▶ mapping ──▶ normalize ──▶ records
//!  (model)     (cells)    (grids)   (fields)    (validated)
//!                            ▲
//!  sheet grid ───────────────┘
//! ```
//!
//! 1. [`repair`]: recover a JSON array of layout cells from malformed output
//! 2. [`table`]: HTML tables and sheet grids → header + data rows, merges expanded
//! 3. [`mapping`]: column headers → canonical fields via ordered regex rules
//! 4. [`normalize`]: number/currency parsing and row validation
//! 5. [`page`]: runs 1–4 for one page and builds its report

pub mod mapping;
pub mod normalize;
pub mod page;
pub mod repair;
pub mod table;
