// Entry point for the announcement audience engine.
//
// **Architecture Overview:**
// - `core/` = Business logic (resolvers, rule arbitration, workflow)
// - `infra/` = Implementations of core traits (SQLite, in-memory)
//
// This file's job is to:
// 1. Load configuration
// 2. Wire stores into the resolvers (dependency injection)
// 3. Run one preview or save against the configured database

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::announce::AnnounceService;
use crate::core::audience::provider::ProviderRegistry;
use crate::core::audience::resolver::AudienceResolver;
use crate::core::directory::{ActingUser, Directory};
use crate::core::moderation::{CcExpansionStore, PrivilegeQuery};
use crate::core::moderation::resolver::ModerationResolver;
use crate::infra::directory::SqliteDirectory;
use crate::infra::posts::SqlitePostStore;
use crate::infra::privileges::SqlitePrivilegeStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // The acting user everything is authorized and resolved as.
    let username = std::env::var("ANNOUNCE_USER")
        .expect("Missing ANNOUNCE_USER environment variable! Set it to the acting username.");
    let acting = ActingUser::new(&username);

    // Tag expression JSON, from the first CLI argument or ANNOUNCE_TAGS_FILE.
    let tags_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ANNOUNCE_TAGS_FILE").ok())
        .expect("Pass a tag expression JSON file as the first argument or set ANNOUNCE_TAGS_FILE.");
    let tags_json = std::fs::read_to_string(&tags_path)?;

    // Keep runtime databases in a dedicated folder so the repo root stays tidy.
    let data_dir = "data";
    std::fs::create_dir_all(data_dir)?;
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}/announce.db?mode=rwc", data_dir))
        .await
        .expect("Failed to connect to announce DB");

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Wire the SQLite stores into the core services.

    let directory = Arc::new(SqliteDirectory::new(pool.clone()));
    directory.migrate().await?;
    let directory: Arc<dyn Directory> = directory;

    let privilege_store = Arc::new(SqlitePrivilegeStore::new(pool.clone()));
    privilege_store.migrate().await?;
    let privileges = Arc::new(PrivilegeQuery::new(privilege_store.clone()));
    let cc_expansions: Arc<dyn CcExpansionStore> = privilege_store;

    let post_store = SqlitePostStore::new(pool.clone());
    post_store.migrate().await?;
    let moderation_log = SqlitePostStore::new(pool);

    let registry = ProviderRegistry::standard(directory.clone(), privileges.clone());
    let audience = AudienceResolver::new(registry.clone(), cc_expansions, directory.clone());
    let moderation = ModerationResolver::new(registry.clone(), privileges, directory);
    let service = AnnounceService::new(registry, audience, moderation, post_store, moderation_log);

    // ANNOUNCE_POST_ID switches from a dry-run preview to a real save.
    match std::env::var("ANNOUNCE_POST_ID")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
    {
        Some(post_id) => {
            let saved = service.save_post(post_id, &acting, &tags_json).await?;
            tracing::info!(
                post_id = saved.post_id,
                record_id = saved.record_id,
                status = %saved.status,
                "post saved"
            );
            println!("post {} saved as {}", saved.post_id, saved.status);
            if saved.verdict.required {
                println!(
                    "awaiting moderation by {} (priority {})",
                    saved.verdict.moderator.as_deref().unwrap_or("<unassigned>"),
                    saved.verdict.priority
                );
            }
            let mut recipients: Vec<_> = saved.recipients.iter().collect();
            recipients.sort();
            for username in recipients {
                println!("  -> {username}");
            }
        }
        None => {
            let preview = service.preview(&acting, &tags_json).await?;
            println!(
                "{} recipients across {} conditions",
                preview.recipients.len(),
                preview.conditions.len()
            );
            if preview.verdict.required {
                println!(
                    "would await moderation by {} (priority {})",
                    preview.verdict.moderator.as_deref().unwrap_or("<unassigned>"),
                    preview.verdict.priority
                );
            } else {
                println!("no moderation required");
            }
            let mut recipients: Vec<_> = preview.recipients.iter().collect();
            recipients.sort();
            for username in recipients {
                println!("  -> {username}");
            }
        }
    }

    Ok(())
}
