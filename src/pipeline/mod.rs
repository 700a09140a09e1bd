//! Pipeline stages for turning one PDF into invoice records.
//!
//! ```text
//! input ──▶ extract ──▶ analyze ──▶ invoice
//! (path/URL) (text/OCR)  (ranges)    (records)
//! ```
//!
//! 1. [`input`]   resolves the document reference to a local PDF
//! 2. [`extract`] gets per-page text from the text layer, or from
//!    [`render`] + [`encode`] + [`ocr`] for image-only pages
//! 3. [`analyze`] splits the pages into one range per invoice
//! 4. [`invoice`] runs one function call per range through [`llm`]

pub mod analyze;
pub mod encode;
pub mod extract;
pub mod input;
pub mod invoice;
pub mod llm;
pub mod ocr;
pub mod render;
