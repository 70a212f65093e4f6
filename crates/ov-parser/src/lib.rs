//! Input parsing for the OpenViking context engine.
//!
//! A registry dispatches inputs to format parsers; every parser emits a
//! canonical scratch tree under `viking://temp/<uuid>/` that the tree
//! builder later promotes into a stable scope.

pub mod code;
pub mod markdown;
pub mod registry;
pub mod splitter;
pub mod text;

pub use registry::{ParseContext, ParseRequest, ParseResult, Parser, ParserRegistry};
pub use splitter::{estimate_tokens, SplitNode, Splitter, TokenCounter};
