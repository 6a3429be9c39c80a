//! Pipeline stages for diploma matching and stamping.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the orchestrator in [`crate::process`] only sequences them.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ resolve ──▶ token ──▶ qr ──▶ stamp
//! (path)    (pdfium)    (directory) (HMAC)   (bitmap) (pdfium)
//! ```
//!
//! 1. [`input`]   validate local PDFs, expand directories, name outputs
//! 2. [`extract`] candidate names from the text layer or the filename;
//!    PDFium access shared with stamping lives in [`pdf`]
//! 3. [`resolve`] score directory records with [`similarity`] and decide
//!    matched / ambiguous / not found
//! 4. [`token`]   the self-contained, keyed verification payload
//! 5. [`qr`]      payload → QR bitmap
//! 6. [`stamp`]   composite the QR onto one page and write atomically

pub mod extract;
pub mod input;
pub mod pdf;
pub mod qr;
pub mod resolve;
pub mod similarity;
pub mod stamp;
pub mod token;
