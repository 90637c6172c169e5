use repostbot::config::Config;
use repostbot::db::{GuildDatabases, CURRENT_SCHEMA_VERSION};
use repostbot::{logging, GuildSettings};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    logging::init(&config.logging)?;
    info!("Logger initialized.");

    if config.guild_ids.is_empty() {
        warn!("No guilds configured. Set GUILD_IDS to prepare guild databases.");
    }

    let mut guilds = GuildDatabases::new(
        &config.databases_dir,
        CURRENT_SCHEMA_VERSION,
        config.seed_defaults(),
    );

    // Every database must be at the current schema before the bot handles events.
    for guild_id in &config.guild_ids {
        let db = match guilds.open(*guild_id) {
            Ok(db) => db,
            Err(e) => {
                error!("Refusing to start: guild {} database failed to prepare: {}", guild_id, e);
                return Err(e.into());
            }
        };

        let settings = db.run_blocking(GuildSettings::load).await?;
        info!(
            "Guild {}: active={}, prefix={:?}, {} blacklisted channel(s), last update {}",
            guild_id,
            settings.active,
            settings.prefix,
            settings.blacklisted_channels.len(),
            settings.last_update
        );
    }

    info!(
        "{} guild database(s) ready in {:?} at schema version {}",
        guilds.len(),
        guilds.dir(),
        CURRENT_SCHEMA_VERSION
    );
    Ok(())
}
