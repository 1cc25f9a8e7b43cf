//! Optimistic parsing of JSON that is still arriving.
//!
//! Tool-call arguments stream in from a model a few bytes at a time. The
//! parser here turns any prefix of such a stream into the best document it can
//! and a dotted-path view of the keys that are already usable.

mod accumulator;
mod error;
mod optimistic;
mod scanner;
mod text;
mod values;

pub use accumulator::{ParseUpdate, StreamingJsonAccumulator};
pub use error::{JsonError, Result};
pub use optimistic::{OptimisticJsonParser, OptimisticParseResult};
pub use text::{extract_first_json_object, normalize_escaped_text, strip_code_fence};
pub use values::{get_optimistic_value, get_optimistic_value_or, ExtractedValues};
