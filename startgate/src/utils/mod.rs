//! Small shared helpers.

mod timestamps;

pub use timestamps::{format_timestamp, iso_timestamp};
