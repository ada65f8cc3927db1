//! The query engine: parses the LogQL-subset selector, picks chunks from
//! the index, filters entries, optionally aggregates, then sorts/limits.

pub mod engine;
pub mod parser;

pub use engine::{execute, QueryResult};
pub use parser::{parse, ParsedQuery};
