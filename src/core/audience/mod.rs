// Core audience module - tag model, pluggable providers, and the resolver
// that turns a tag expression into a recipient set.

pub mod combination_provider;
pub mod course_provider;
pub mod group_provider;
pub mod profile_provider;
pub mod provider;
pub mod resolver;
pub mod tags;
pub mod user_provider;

pub use combination_provider::*;
pub use course_provider::*;
pub use group_provider::*;
pub use profile_provider::*;
pub use provider::*;
pub use resolver::*;
pub use tags::*;
pub use user_provider::*;
