//! Prompt templates for boundary analysis, field extraction and OCR.
//!
//! Every prompt lives here so unit tests can inspect them without a provider.

use crate::task::ProcessType;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// System prompt for transcribing one rasterised page.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are an OCR engine. Transcribe all text visible on the page image.

Rules:
- Preserve reading order as a human would read the page
- Keep numbers, dates, currency amounts and identifiers exactly as printed
- Keep table rows on one line each, cells separated by " | "
- Do NOT summarise, translate, or add commentary
- If the page has no legible text, output nothing"#;

/// Instructions appended to every function-calling system prompt.
///
/// `{name}`, `{description}` and `{schema}` are substituted by
/// [`function_instructions`].
const FUNCTION_TEMPLATE: &str = r#"

You must answer by calling the function `{name}`: {description}.
Reply with ONLY a JSON object holding the function arguments. It must match this JSON Schema:

{schema}

Do not wrap the JSON in markdown fences. Use null for any value you cannot confirm from the document."#;

pub fn function_instructions(name: &str, description: &str, schema: &Value) -> String {
    let schema = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    FUNCTION_TEMPLATE
        .replace("{name}", name)
        .replace("{description}", description)
        .replace("{schema}", &schema)
}

/// Render caller-supplied metadata as an indented key/value block.
pub fn format_metadata(metadata: &BTreeMap<String, Value>) -> String {
    let mut out = String::new();
    for (key, value) in metadata {
        write_value(&mut out, key, value, 0);
    }
    out
}

fn write_value(out: &mut String, key: &str, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Array(items) => {
            let _ = writeln!(out, "{pad}{key}:");
            for item in items {
                match item {
                    Value::String(s) => {
                        let _ = writeln!(out, "{pad}  - {s}");
                    }
                    other => {
                        let _ = writeln!(out, "{pad}  - {other}");
                    }
                }
            }
        }
        Value::Object(map) => {
            let _ = writeln!(out, "{pad}{key}:");
            for (k, v) in map {
                write_value(out, k, v, depth + 1);
            }
        }
        Value::String(s) => {
            let _ = writeln!(out, "{pad}{key}: {s}");
        }
        other => {
            let _ = writeln!(out, "{pad}{key}: {other}");
        }
    }
}

/// System prompt for proposing invoice boundaries.
pub fn page_analysis_prompt(
    total_pages: usize,
    invoice_count: usize,
    metadata: Option<&BTreeMap<String, Value>>,
) -> String {
    let mut prompt = format!(
        r#"You are an expert in identifying invoices and determining page ranges in PDF documents.
Based on the following information, determine the page range of each invoice:

1. Total number of pages: {total_pages}
2. Number of invoices included: {invoice_count}
3. Criteria for distinguishing invoices:
   - Each invoice typically starts on a new page.
   - A new invoice is indicated by a new invoice number, date, and customer information.
   - Consecutive pages of the same invoice usually carry page numbers or continuity indicators.
"#
    );

    if let Some(meta) = metadata.filter(|m| !m.is_empty()) {
        let _ = write!(
            prompt,
            "\n4. Additional information:\n{}\nUse it to split more accurately. \
             If customer names are provided, match them with the customer of each invoice.\n",
            format_metadata(meta)
        );
    }

    let _ = write!(
        prompt,
        "\nSplit the document into exactly {invoice_count} invoices. Ranges must be sorted, \
         must not overlap, and together must cover every page.\n\
         Page numbers start from 1 and must be between 1 and {total_pages}; end_page is inclusive."
    );
    prompt
}

/// User message for boundary analysis: one `=== Page N ===` block per page,
/// each truncated to `max_chars` characters.
pub fn page_analysis_input(pages: &[String], max_chars: usize) -> String {
    let mut out = String::new();
    for (i, text) in pages.iter().enumerate() {
        let _ = writeln!(out, "=== Page {} ===", i + 1);
        let truncated: String = text.chars().take(max_chars).collect();
        out.push_str(truncated.trim_end());
        out.push('\n');
    }
    out
}

/// System prompt for extracting one record.
pub fn extraction_prompt(
    process_type: ProcessType,
    analysis_reason: Option<&str>,
    metadata: Option<&BTreeMap<String, Value>>,
) -> String {
    let document = match process_type {
        ProcessType::Invoice => "invoice",
        ProcessType::Receipt => "receipt",
    };
    let mut prompt = format!(
        r#"You are an expert in extracting {document} data. Follow these rules:

1. Data integrity
   - Extract only explicitly displayed data; never guess or calculate missing values
   - Extract amounts as plain numbers without thousands separators or currency symbols
   - Dates must be YYYY-MM-DD

2. Line items
   - A row is an item only if it has a name, a quantity and a unit price
   - Skip note rows, section headings, and subtotal or total rows

3. Amounts
   - Prefer explicitly printed totals over values computed from the items
   - Subtotal + taxes should equal the total; if they disagree, keep the printed values
   - Negative amounts (refunds, discounts) keep their sign; parentheses mean negative

4. Empty values
   - Use null for any field that is not present or cannot be confirmed
"#
    );

    if let Some(meta) = metadata.filter(|m| !m.is_empty()) {
        let _ = write!(
            prompt,
            "\nAdditional information:\n{}Use it for more accurate extraction.\n",
            format_metadata(meta)
        );
    }

    if let Some(reason) = analysis_reason.filter(|r| !r.trim().is_empty()) {
        let _ = write!(
            prompt,
            "\nPage analysis:\n{reason}\nUse this analysis to locate the amounts.\n"
        );
    }
    prompt
}

/// User message for one range: the range's pages, labelled with their
/// 1-based numbers.
pub fn extraction_input(first_page: usize, pages: &[String]) -> String {
    let mut out = String::new();
    for (offset, text) in pages.iter().enumerate() {
        let _ = writeln!(out, "=== Page {} ===", first_page + offset);
        out.push_str(text.trim_end());
        out.push('\n');
    }
    out
}
