//! Backend output stream handling.
//!
//! - `codec`: newline framing with a bounded line length.
//! - `parser`: one line in, one typed update (or the terminal result) out.
//! - `summary`: post-hoc scans of the captured raw messages.

pub mod codec;
pub mod parser;
pub mod summary;
