//! Detector data acquisition
//!
//! Turns raw detector text lines into [`EventRecord`](crate::types::EventRecord)s.
//! The transports that deliver those lines live in `pipeline::source`.

pub mod line_parser;

pub use line_parser::{LineParser, ParseError, ParsedLine, ParserOptions, StartMode};
