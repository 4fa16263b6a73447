//! Utility functions for timestamps and identifiers.

mod ids;
mod timestamps;

pub use ids::{generate_instance_id, generate_owner_token};
pub use timestamps::{iso_timestamp, now_millis};
