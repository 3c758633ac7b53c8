//! Job model: identifiers, priority classes, lifecycle state and results.

mod platform;
mod types;

pub use platform::platform_from_url;
pub use types::*;
