//! Prompts sent with each page image.
//!
//! Every prompt asks the model for the same shape of answer: a JSON array of
//! layout cells `{"bbox": [x1, y1, x2, y2], "category": "...", "text": "..."}`
//! with tables rendered as HTML. [`crate::pipeline::repair`] depends on that
//! shape; changing it here means changing the repair stage too.
//!
//! Callers can override the text via
//! [`crate::config::ParseOptions::system_prompt`]; the constants here are
//! used only when no override is provided.

use crate::config::PromptMode;

/// Full layout extraction: every element on the page, tables as HTML.
pub const LAYOUT_ALL_PROMPT: &str = r#"Please output the layout information from the pricelist image, including each layout element's bbox, its category, and the corresponding text content within the bbox.

1. Bbox format: [x1, y1, x2, y2]

2. Layout Categories: The possible categories are ['Caption', 'Footnote', 'Formula', 'List-item', 'Page-footer', 'Page-header', 'Picture', 'Section-header', 'Table', 'Text', 'Title'].

3. Text Extraction & Formatting Rules:
    - Picture: For the 'Picture' category, the text field should be omitted.
    - Table: Format its text as HTML. Keep rowspan and colspan attributes of merged cells.
    - All Others (Text, Title, etc.): Format their text as Markdown.

4. Constraints:
    - The output text must be the original text from the image, with no translation.
    - Prices must be copied exactly as printed, including currency symbols and separators.
    - All layout elements must be sorted according to human reading order.

5. Final Output: The entire output must be a single JSON array."#;

/// Tables only: skip running text so the token budget goes to the grid.
pub const TABLES_ONLY_PROMPT: &str = r#"Extract every table from the pricelist image.

Output a JSON array. Each element is an object with:
  - "bbox": [x1, y1, x2, y2] of the table
  - "category": "Table"
  - "text": the table as HTML (<table>, <thead>, <tr>, <th>, <td>), keeping rowspan and colspan attributes of merged cells

Rules:
  - Copy cell text exactly as printed, with no translation.
  - Prices must keep their currency symbols and separators.
  - Order tables from top to bottom.
  - Output ONLY the JSON array, with no commentary."#;

/// Resolve the prompt text for a mode, honouring a caller override.
pub fn prompt_text<'a>(mode: PromptMode, override_text: Option<&'a str>) -> &'a str {
    if let Some(text) = override_text {
        return text;
    }
    match mode {
        PromptMode::LayoutAll => LAYOUT_ALL_PROMPT,
        PromptMode::TablesOnly => TABLES_ONLY_PROMPT,
    }
}
