use crate::db::{Database, Result};

/// Per-guild settings loaded once at startup.
///
/// During a run this struct is the source of truth; the setters write
/// through to the database so the next start sees the same values.
#[derive(Debug, Clone, PartialEq)]
pub struct GuildSettings {
    pub active: bool,
    pub prefix: String,
    pub oldest_update: f64,
    pub last_update: f64,
    pub emoji: Vec<String>,
    pub blacklisted_channels: Vec<u64>,
}

impl GuildSettings {
    pub fn load(db: &Database) -> Result<Self> {
        let (oldest_update, last_update) = db.get_updates()?;
        Ok(Self {
            active: db.get_active()?,
            prefix: db.get_prefix()?,
            oldest_update,
            last_update,
            emoji: db.get_emoji()?,
            blacklisted_channels: db.get_blacklisted_channels()?,
        })
    }

    pub fn is_channel_blacklisted(&self, channel_id: u64) -> bool {
        self.blacklisted_channels.contains(&channel_id)
    }

    /// Whether `content` starts with the command prefix, ignoring case.
    pub fn matches_prefix(&self, content: &str) -> bool {
        !self.prefix.is_empty() && content.to_lowercase().starts_with(&self.prefix.to_lowercase())
    }

    /// Scanning is skipped for inactive guilds and blacklisted channels.
    pub fn should_scan(&self, channel_id: u64) -> bool {
        self.active && !self.is_channel_blacklisted(channel_id)
    }

    /// Widens the watermarks to cover `scanned_from..=scanned_to` and
    /// persists them.
    pub fn record_scan(&mut self, db: &Database, scanned_from: f64, scanned_to: f64) -> Result<()> {
        let oldest = self.oldest_update.min(scanned_from);
        let last = self.last_update.max(scanned_to);
        db.set_updates(oldest, last)?;
        self.oldest_update = oldest;
        self.last_update = last;
        Ok(())
    }

    pub fn set_active(&mut self, db: &Database, active: bool) -> Result<()> {
        db.set_active(active)?;
        self.active = active;
        Ok(())
    }

    pub fn set_prefix(&mut self, db: &Database, prefix: &str) -> Result<()> {
        db.set_prefix(prefix)?;
        self.prefix = prefix.to_string();
        Ok(())
    }

    pub fn blacklist_channel(&mut self, db: &Database, channel_id: u64) -> Result<()> {
        if db.blacklist_channel(channel_id)? {
            if let Err(pos) = self.blacklisted_channels.binary_search(&channel_id) {
                self.blacklisted_channels.insert(pos, channel_id);
            }
        }
        Ok(())
    }

    pub fn unblacklist_channel(&mut self, db: &Database, channel_id: u64) -> Result<()> {
        db.unblacklist_channel(channel_id)?;
        self.blacklisted_channels.retain(|id| *id != channel_id);
        Ok(())
    }
}
