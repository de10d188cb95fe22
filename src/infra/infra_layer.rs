// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

#[path = "directory/mod.rs"]
pub mod directory;

#[path = "privileges/sqlite_privilege_store.rs"]
pub mod privileges;

#[path = "posts/sqlite_post_store.rs"]
pub mod posts;
