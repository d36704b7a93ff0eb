//! Small helpers shared by the feed pipeline and the CLI.
//!
//! - **Text**: character-safe truncation, whitespace collapsing, control
//!   sequence stripping for untrusted feed text
//! - **URLs**: feed address validation and `Location` header resolution

mod links;
mod text;

pub use links::{resolve_location, site_origin, validate_feed_url, UrlValidationError};
pub use text::{collapse_whitespace, strip_control_chars, truncate_chars};
