// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "directory/directory_port.rs"]
pub mod directory;

#[path = "audience/mod.rs"]
pub mod audience;

#[path = "moderation/mod.rs"]
pub mod moderation;

#[path = "announce/announce_service.rs"]
pub mod announce;

// Shared fakes for the core test modules.
#[cfg(test)]
#[path = "testsupport.rs"]
pub mod testsupport;
