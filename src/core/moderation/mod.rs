// Core moderation module - privilege rule table and verdict resolution.
// Following the same pattern as the audience module.

pub mod privilege;
pub mod resolver;
pub mod status;

pub use privilege::*;
pub use resolver::*;
pub use status::*;
