use crate::db::SeedDefaults;
use crate::logging::{LogProfile, LoggingConfig};
use dotenvy::dotenv;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one `<guild_id>.sqlite3` file per guild
    pub databases_dir: PathBuf,
    /// Guilds whose databases are prepared at startup
    pub guild_ids: Vec<u64>,
    pub default_prefix: String,
    pub default_emoji: String,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            databases_dir: env::var("DATABASES_DIR")
                .unwrap_or_else(|_| "databases".to_string())
                .into(),
            guild_ids: Self::parse_guild_ids(&env::var("GUILD_IDS").unwrap_or_default())?,
            default_prefix: env::var("DEFAULT_PREFIX").unwrap_or_else(|_| "$".to_string()),
            default_emoji: env::var("DEFAULT_EMOJI").unwrap_or_else(|_| "recycle".to_string()),
            logging: Self::load_logging()?,
        })
    }

    fn parse_guild_ids(raw: &str) -> anyhow::Result<Vec<u64>> {
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                id.parse()
                    .map_err(|_| anyhow::anyhow!("GUILD_IDS entry {:?} is not a valid u64", id))
            })
            .collect()
    }

    /// Starts from `LOG_PROFILE` and `LOG_FILE`, then applies the TOML file
    /// named by `LOGGING_CONFIG` when it exists.
    pub fn load_logging() -> anyhow::Result<LoggingConfig> {
        let profile: LogProfile = env::var("LOG_PROFILE")
            .unwrap_or_else(|_| "standard".to_string())
            .parse()?;
        let mut logging = LoggingConfig::from_profile(profile);
        if let Ok(file) = env::var("LOG_FILE") {
            logging.file = file.into();
        }

        let path = env::var("LOGGING_CONFIG").unwrap_or_else(|_| "logging.toml".to_string());
        if let Ok(content) = fs::read_to_string(&path) {
            logging = logging.merge_toml(&content)?;
        }
        Ok(logging)
    }

    pub fn seed_defaults(&self) -> SeedDefaults {
        SeedDefaults {
            prefix: self.default_prefix.clone(),
            emoji: self.default_emoji.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tracing::Level;

    #[test]
    fn test_config_logic() {
        // 1. Test defaults
        env::remove_var("DATABASES_DIR");
        env::remove_var("GUILD_IDS");
        env::remove_var("DEFAULT_PREFIX");
        env::remove_var("LOG_PROFILE");
        env::remove_var("LOG_FILE");
        env::set_var("LOGGING_CONFIG", "/nonexistent/logging.toml");
        let config = Config::build().unwrap();
        assert_eq!(config.databases_dir, PathBuf::from("databases"));
        assert!(config.guild_ids.is_empty());
        assert_eq!(config.seed_defaults(), SeedDefaults::default());
        assert_eq!(config.logging.console_level, Level::INFO);
        assert_eq!(config.logging.file_level, Level::DEBUG);
        assert_eq!(config.logging.file, PathBuf::from("bot.log"));

        // 2. Test overrides
        env::set_var("GUILD_IDS", " 123, 456 ,");
        env::set_var("DEFAULT_PREFIX", "!rb");
        env::set_var("LOG_PROFILE", "verbose");
        env::set_var("LOG_FILE", "logs/repost.log");
        let config = Config::build().unwrap();
        assert_eq!(config.guild_ids, vec![123, 456]);
        assert_eq!(config.seed_defaults().prefix, "!rb");
        assert_eq!(config.logging.console_level, Level::DEBUG);
        assert_eq!(config.logging.file_level, Level::INFO);
        assert_eq!(config.logging.file, PathBuf::from("logs/repost.log"));

        // 3. Test invalid values
        env::set_var("GUILD_IDS", "123,abc");
        assert!(Config::build().is_err());
        env::set_var("GUILD_IDS", "123");
        env::set_var("LOG_PROFILE", "loud");
        assert!(Config::build().is_err());

        // Cleanup
        env::remove_var("GUILD_IDS");
        env::remove_var("DEFAULT_PREFIX");
        env::remove_var("LOG_PROFILE");
        env::remove_var("LOG_FILE");
        env::remove_var("LOGGING_CONFIG");
    }
}
