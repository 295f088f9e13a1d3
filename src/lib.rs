//! Metered OCR: run images through an OCR engine while charging each page
//! against a persistent monthly usage quota.

pub mod aws;
pub mod cmd;
pub mod ocr;
pub mod output;
pub mod prelude;
pub mod quota;
pub mod retry;
pub mod ui;
