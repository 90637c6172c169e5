pub mod config;
pub mod db;
pub mod logging;
pub mod settings;

pub use settings::GuildSettings;
