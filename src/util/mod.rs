//! Small helpers shared by the store and the CLI.
//!
//! - **Source urls**: the shape check every stored source url must pass
//! - **Text**: control-character stripping for feed-supplied names, and
//!   width-aware truncation for terminal listings

mod text;
mod url_validator;

pub use text::{display_width, fit_to_width, strip_control_chars, truncate_to_width};
pub use url_validator::{validate_source_url, SourceUrlError};
