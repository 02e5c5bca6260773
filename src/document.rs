//! Documents, pages and sheets as they enter the pipeline.
//!
//! Rasterisation of PDFs and cell reading of workbooks happen outside this
//! crate: a [`Document`] arrives already split into page images (pdf,
//! image) or into sheet grids with merge metadata (spreadsheet). A document
//! is immutable once constructed.
//!
//! ## Page preparation
//!
//! Before inference each page image is decoded and resized so its pixel
//! count sits inside the configured budget, with both edges rounded to a
//! multiple of [`IMAGE_FACTOR`] (the vision encoder's patch size). Decoding
//! and resampling are CPU-bound, so [`prepare_page_async`] runs them on
//! `spawn_blocking`, one page at a time.

use crate::config::IMAGE_FACTOR;
use crate::error::{InputError, PageError, PricelistError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};

/// Aspect ratios beyond this are rejected; the encoder cannot tile them.
const MAX_ASPECT_RATIO: f64 = 200.0;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls"];

/// Largest sheet grid (rows × widest row) accepted.
pub const MAX_SHEET_CELLS: usize = 2_000_000;

/// What kind of source a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Image,
    Spreadsheet,
}

impl DocumentKind {
    /// Detect the kind from a file name's extension.
    pub fn from_file_name(file_name: &str) -> Result<Self, InputError> {
        let ext = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if ext == "pdf" {
            Ok(DocumentKind::Pdf)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(DocumentKind::Image)
        } else if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            Ok(DocumentKind::Spreadsheet)
        } else {
            Err(InputError::UnsupportedFileType {
                file_name: file_name.to_string(),
                extension: if ext.is_empty() {
                    "(none)".to_string()
                } else {
                    format!(".{ext}")
                },
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Image => "image",
            DocumentKind::Spreadsheet => "spreadsheet",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rasterised page as received (PNG or JPEG bytes).
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-indexed position in the document.
    pub number: usize,
    pub image: Vec<u8>,
}

/// Inclusive, 0-indexed merged region of a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRange {
    pub first_row: usize,
    pub first_col: usize,
    pub last_row: usize,
    pub last_col: usize,
}

impl MergeRange {
    /// The part of this region inside a `height` × `width` grid. `None` if
    /// the range is inverted or its origin lies outside the grid.
    pub fn clamp_to(&self, height: usize, width: usize) -> Option<MergeRange> {
        if self.first_row > self.last_row
            || self.first_col > self.last_col
            || self.first_row >= height
            || self.first_col >= width
        {
            return None;
        }
        Some(MergeRange {
            last_row: self.last_row.min(height - 1),
            last_col: self.last_col.min(width - 1),
            ..*self
        })
    }
}

/// One worksheet: a raw cell grid plus its merged regions.
///
/// Only the origin (top-left) cell of a merged region carries a value;
/// covered cells are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Option<String>>>,
    pub merges: Vec<MergeRange>,
}

impl Sheet {
    /// Rows and widest row, the extent of the cell grid.
    pub fn dimensions(&self) -> (usize, usize) {
        let width = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        (self.rows.len(), width)
    }

    pub fn is_blank(&self) -> bool {
        self.rows
            .iter()
            .flatten()
            .all(|c| c.as_deref().is_none_or(|v| v.trim().is_empty()))
    }
}

/// JSON form of an exported workbook sheet.
///
/// Cells may be strings, numbers, booleans or null.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetGrid {
    pub name: String,
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub merges: Vec<MergeRange>,
}

impl From<SheetGrid> for Sheet {
    fn from(grid: SheetGrid) -> Self {
        let rows = grid
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect();
        Sheet {
            name: grid.name,
            rows,
            merges: grid.merges,
        }
    }
}

/// Reject grids too large to flatten and merges that point outside the grid.
fn check_sheet(sheet: &Sheet) -> Result<(), String> {
    let (height, width) = sheet.dimensions();
    if height.saturating_mul(width) > MAX_SHEET_CELLS {
        return Err(format!(
            "{height}x{width} cells exceeds the limit of {MAX_SHEET_CELLS}"
        ));
    }
    for m in &sheet.merges {
        if m.clamp_to(height, width) != Some(*m) {
            return Err(format!(
                "merge rows {}-{} cols {}-{} is outside the {height}x{width} grid",
                m.first_row, m.last_row, m.first_col, m.last_col
            ));
        }
    }
    Ok(())
}

fn cell_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => match n.as_f64() {
            // Whole floats print without the trailing ".0".
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone)]
enum Content {
    Pages(Vec<Page>),
    Sheets(Vec<Sheet>),
}

/// An immutable input unit.
#[derive(Debug, Clone)]
pub struct Document {
    file_name: String,
    kind: DocumentKind,
    content: Content,
}

impl Document {
    /// A paged document (pdf pages or a single image), kind taken from the file name.
    pub fn from_page_images(
        file_name: impl Into<String>,
        images: Vec<Vec<u8>>,
    ) -> Result<Self, InputError> {
        let file_name = file_name.into();
        let kind = DocumentKind::from_file_name(&file_name)?;
        match kind {
            DocumentKind::Spreadsheet => {
                return Err(InputError::CorruptDocument {
                    file_name,
                    detail: "spreadsheets are ingested as sheet grids, not page images".into(),
                })
            }
            DocumentKind::Image if images.len() > 1 => {
                return Err(InputError::CorruptDocument {
                    file_name,
                    detail: format!("an image document has one page, got {}", images.len()),
                })
            }
            _ => {}
        }
        if images.is_empty() || images.iter().all(|i| i.is_empty()) {
            return Err(InputError::EmptyDocument { file_name });
        }
        let pages = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| Page {
                number: i + 1,
                image,
            })
            .collect();
        Ok(Self {
            file_name,
            kind,
            content: Content::Pages(pages),
        })
    }

    /// A single-image document.
    pub fn image(file_name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, InputError> {
        Self::from_page_images(file_name, vec![bytes])
    }

    /// A spreadsheet document; blank sheets are dropped.
    pub fn spreadsheet(
        file_name: impl Into<String>,
        sheets: Vec<Sheet>,
    ) -> Result<Self, InputError> {
        let file_name = file_name.into();
        let kind = DocumentKind::from_file_name(&file_name)?;
        if kind != DocumentKind::Spreadsheet {
            return Err(InputError::CorruptDocument {
                file_name,
                detail: format!("expected a spreadsheet, file name says {kind}"),
            });
        }
        let sheets: Vec<Sheet> = sheets.into_iter().filter(|s| !s.is_blank()).collect();
        if sheets.is_empty() {
            return Err(InputError::EmptyDocument { file_name });
        }
        for sheet in &sheets {
            if let Err(detail) = check_sheet(sheet) {
                return Err(InputError::CorruptDocument {
                    file_name,
                    detail: format!("sheet '{}': {detail}", sheet.name),
                });
            }
        }
        Ok(Self {
            file_name,
            kind,
            content: Content::Sheets(sheets),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    /// Number of pages or sheets.
    pub fn page_count(&self) -> usize {
        match &self.content {
            Content::Pages(p) => p.len(),
            Content::Sheets(s) => s.len(),
        }
    }

    pub fn pages(&self) -> &[Page] {
        match &self.content {
            Content::Pages(p) => p,
            Content::Sheets(_) => &[],
        }
    }

    pub fn sheets(&self) -> &[Sheet] {
        match &self.content {
            Content::Sheets(s) => s,
            Content::Pages(_) => &[],
        }
    }
}

/// Load a document from disk for the command-line front end.
///
/// * an image file becomes a one-page image document;
/// * a directory of page images becomes a pdf document named after the
///   directory, pages in file-name order;
/// * a `*.json` file is read as an array of [`SheetGrid`]s and becomes a
///   spreadsheet document named after the file stem with `.xlsx`.
pub fn load_document(path: &Path) -> Result<Document, PricelistError> {
    let path_str = path.display().to_string();
    let unreadable = |e: std::io::Error| InputError::Unreadable {
        path: path_str.clone(),
        detail: e.to_string(),
    };

    if path.is_dir() {
        let mut files: Vec<_> = std::fs::read_dir(path)
            .map_err(unreadable)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_string_lossy().to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        let images = files
            .iter()
            .map(std::fs::read)
            .collect::<Result<Vec<_>, _>>()
            .map_err(unreadable)?;
        let stem = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        debug!("Loaded {} page images from {}", images.len(), path_str);
        return Ok(Document::from_page_images(format!("{stem}.pdf"), images)?);
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path_str.clone());

    if file_name.to_ascii_lowercase().ends_with(".json") {
        let text = std::fs::read_to_string(path).map_err(unreadable)?;
        let grids: Vec<SheetGrid> =
            serde_json::from_str(&text).map_err(|e| InputError::CorruptDocument {
                file_name: file_name.clone(),
                detail: format!("invalid sheet grid JSON: {e}"),
            })?;
        let stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workbook".to_string());
        let stem = stem.strip_suffix(".sheets").unwrap_or(&stem).to_string();
        return Ok(Document::spreadsheet(
            format!("{stem}.xlsx"),
            grids.into_iter().map(Sheet::from).collect(),
        )?);
    }

    match DocumentKind::from_file_name(&file_name)? {
        DocumentKind::Image => {
            let bytes = std::fs::read(path).map_err(unreadable)?;
            Ok(Document::image(file_name, bytes)?)
        }
        kind => Err(InputError::NotPreprocessed {
            file_name,
            hint: match kind {
                DocumentKind::Pdf => "rasterise the pdf into a directory of page images first".into(),
                _ => "export the workbook as sheet-grid JSON first".into(),
            },
        }
        .into()),
    }
}

// ── Page preparation ─────────────────────────────────────────────────────

/// A decoded, budget-resized page ready for inference.
#[derive(Debug, Clone)]
pub struct PreparedPage {
    pub number: usize,
    /// PNG bytes.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PreparedPage {
    /// Base64 of the PNG, for data URLs and multimodal request bodies.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.png)
    }
}

/// Compute target `(height, width)` for an image under the pixel budget.
///
/// Both edges become multiples of `factor`, the aspect ratio is kept as
/// closely as rounding allows, and `min_pixels ≤ h·w ≤ max_pixels`.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32), String> {
    if height == 0 || width == 0 {
        return Err("image has a zero dimension".into());
    }
    let (h, w, f) = (height as f64, width as f64, factor as f64);
    if h.max(w) / h.min(w) > MAX_ASPECT_RATIO {
        return Err(format!(
            "aspect ratio must be below {MAX_ASPECT_RATIO}, got {:.1}",
            h.max(w) / h.min(w)
        ));
    }
    let round_to = |v: f64| ((v / f).round() * f).max(f);
    let mut h_bar = round_to(h);
    let mut w_bar = round_to(w);
    if h_bar * w_bar > max_pixels as f64 {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = ((h / beta / f).floor() * f).max(f);
        w_bar = ((w / beta / f).floor() * f).max(f);
    } else if h_bar * w_bar < min_pixels as f64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = (h * beta / f).ceil() * f;
        w_bar = (w * beta / f).ceil() * f;
    }
    Ok((h_bar as u32, w_bar as u32))
}

/// Decode, resize and PNG-encode one page. Blocking.
pub fn prepare_page(page: &Page, min_pixels: u32, max_pixels: u32) -> Result<PreparedPage, PageError> {
    let fail = |detail: String| PageError::PreparationFailed {
        page: page.number,
        detail,
    };
    let img = image::load_from_memory(&page.image).map_err(|e| fail(e.to_string()))?;
    let (height, width) = smart_resize(img.height(), img.width(), IMAGE_FACTOR, min_pixels, max_pixels)
        .map_err(fail)?;
    let img = if (width, height) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    };

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| fail(e.to_string()))?;
    debug!(
        "Page {}: prepared {}x{} → {} bytes PNG",
        page.number,
        width,
        height,
        png.len()
    );

    Ok(PreparedPage {
        number: page.number,
        png,
        width,
        height,
    })
}

/// [`prepare_page`] on the blocking pool.
///
/// The page may fail on its own; a crash of the preparation task itself is
/// an orchestration error.
pub async fn prepare_page_async(
    page: Page,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<Result<PreparedPage, PageError>, PricelistError> {
    let prepared = tokio::task::spawn_blocking(move || prepare_page(&page, min_pixels, max_pixels))
        .await
        .map_err(|e| PricelistError::Orchestration {
            detail: format!("page preparation task panicked: {e}"),
        })?;
    if let Err(ref e) = prepared {
        warn!("{e}");
    }
    Ok(prepared)
}
