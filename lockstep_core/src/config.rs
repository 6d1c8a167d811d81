// Session configuration.
//
// One `SessionConfig` describes both sides of a session: the host reads the
// capacity, cadence, timeouts and pause policy from it, and a client reads
// the name and passwords it joins with. It is a plain serde struct stored as
// JSON; every field has a default, so a config file only needs the fields it
// changes.
//
// Tick-based settings are in simulation ticks. `lag_grace_ticks` defaults to
// one in-game day (74 ticks): a peer that has been silent for less than that
// (plus one frame) accrues no extra lag.
//
// Secrets kept here: `server_id` is the salt mixed into group password
// hashes, and `storage_token` / `storage_secret` are the hex-encoded keys
// used to seal group secrets into saved sessions. All three are generated on
// first start by `ensure_storage_keys` and must then be persisted, or saved
// sessions become unreadable.
//
// `server_game_type` decides whether a rendezvous coordinator advertises the
// session: a `Local` session is never registered.

use std::collections::BTreeMap;
use std::path::Path;

use lockstep_protocol::types::{DEFAULT_PORT, MAX_GROUPS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{
    CredentialError, EntropySource, KEY_LENGTH, StorageKeys, TOKEN_LENGTH, random_key_string,
};
use crate::handshake::TimeoutLimits;

/// Length in bytes of a generated `server_id`.
pub const SERVER_ID_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// How widely a hosted session is advertised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerGameType {
    /// Reachable only by address; never registered with a coordinator.
    #[default]
    Local,
    /// Registered, but joinable only through an invite code.
    InviteOnly,
    /// Registered and listed publicly.
    Public,
}

impl ServerGameType {
    pub fn is_advertised(self) -> bool {
        self != ServerGameType::Local
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub server_name: String,
    pub client_name: String,
    pub server_port: u16,
    pub server_game_type: ServerGameType,
    /// Remote peers the host admits at once.
    pub max_clients: u16,
    /// Playable groups; joins asking for a higher group spectate.
    pub max_groups: u8,

    pub frame_freq: u64,
    pub sync_freq: u64,
    pub lag_grace_ticks: u64,
    pub ack_interval_ticks: u64,
    /// Real-time length of one tick on the host, in milliseconds.
    pub tick_millis: u64,

    pub max_lag_ticks: u64,
    pub max_join_ticks: u64,
    pub max_password_ticks: u64,
    pub max_download_ticks: u64,

    pub min_active_clients: u32,
    pub pause_on_join: bool,
    /// The host takes no group of its own.
    pub dedicated: bool,

    pub session_password: Option<String>,
    /// Plain-text group passwords, keyed by zero-based group index.
    pub group_passwords: BTreeMap<u8, String>,
    pub max_commands_in_queue: u32,

    pub server_id: String,
    pub storage_token: String,
    pub storage_secret: String,

    /// Manually added servers, as normalized `address:port` strings.
    pub known_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_name: "lockstep-session".into(),
            client_name: "player".into(),
            server_port: DEFAULT_PORT,
            server_game_type: ServerGameType::Local,
            max_clients: 25,
            max_groups: MAX_GROUPS,
            frame_freq: 1,
            sync_freq: 100,
            lag_grace_ticks: 74,
            ack_interval_ticks: 74,
            tick_millis: 30,
            max_lag_ticks: 500,
            max_join_ticks: 500,
            max_password_ticks: 2000,
            max_download_ticks: 1000,
            min_active_clients: 0,
            pause_on_join: true,
            dedicated: false,
            session_password: None,
            group_passwords: BTreeMap::new(),
            max_commands_in_queue: 16,
            server_id: String::new(),
            storage_token: String::new(),
            storage_secret: String::new(),
            known_servers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        };
        if self.frame_freq == 0 {
            return invalid("frame_freq must be at least 1");
        }
        if self.sync_freq == 0 {
            return invalid("sync_freq must be at least 1");
        }
        if self.ack_interval_ticks == 0 {
            return invalid("ack_interval_ticks must be at least 1");
        }
        if self.max_clients == 0 {
            return invalid("max_clients must be at least 1");
        }
        if self.max_groups == 0 || self.max_groups > MAX_GROUPS {
            return Err(ConfigError::Invalid(format!(
                "max_groups must be between 1 and {MAX_GROUPS}"
            )));
        }
        if let Some(group) = self.group_passwords.keys().find(|g| **g >= self.max_groups) {
            return Err(ConfigError::Invalid(format!(
                "password set for group {group}, but only {} groups exist",
                self.max_groups
            )));
        }
        Ok(())
    }

    /// Registry capacity: every remote peer plus the host.
    pub fn capacity(&self) -> usize {
        usize::from(self.max_clients) + 1
    }

    pub fn timeout_limits(&self) -> TimeoutLimits {
        TimeoutLimits {
            password: self.max_password_ticks,
            join: self.max_join_ticks,
            download: self.max_download_ticks,
        }
    }

    /// The session password, if one is set and non-empty.
    pub fn session_password(&self) -> Option<&str> {
        self.session_password.as_deref().filter(|p| !p.is_empty())
    }

    /// The password of `group`, if one is set and non-empty.
    pub fn group_password(&self, group: u8) -> Option<&str> {
        self.group_passwords
            .get(&group)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// Generate `server_id` and the storage keys if missing. Returns whether
    /// anything was generated (and so needs saving).
    pub fn ensure_storage_keys(&mut self, entropy: &mut dyn EntropySource) -> bool {
        let mut changed = false;
        if self.server_id.is_empty() {
            self.server_id = random_key_string(entropy, SERVER_ID_LENGTH);
            changed = true;
        }
        if self.storage_token.len() != TOKEN_LENGTH * 2 {
            self.storage_token = random_key_string(entropy, TOKEN_LENGTH);
            changed = true;
        }
        if self.storage_secret.len() != KEY_LENGTH * 2 {
            self.storage_secret = random_key_string(entropy, KEY_LENGTH);
            changed = true;
        }
        changed
    }

    pub fn storage_keys(&self) -> Result<StorageKeys, ConfigError> {
        Ok(StorageKeys::from_hex(
            &self.storage_token,
            &self.storage_secret,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::credentials::OsEntropy;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capacity(), 26);
        assert_eq!(config.lag_grace_ticks, 74);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{ "server_name": "Harbor", "frame_freq": 4, "group_passwords": { "2": "pier" } }"#,
        )
        .unwrap();
        assert_eq!(config.server_name, "Harbor");
        assert_eq!(config.frame_freq, 4);
        assert_eq!(config.sync_freq, 100);
        assert_eq!(config.group_password(2), Some("pier"));
        assert_eq!(config.group_password(3), None);
        assert_eq!(config.server_game_type, ServerGameType::Local);
    }

    #[test]
    fn game_type_is_snake_case() {
        let config = SessionConfig::from_json_str(r#"{ "server_game_type": "invite_only" }"#)
            .unwrap();
        assert_eq!(config.server_game_type, ServerGameType::InviteOnly);
        assert!(config.server_game_type.is_advertised());
        assert!(!ServerGameType::Local.is_advertised());
    }

    #[test]
    fn zero_frame_freq_is_rejected() {
        assert!(matches!(
            SessionConfig::from_json_str(r#"{ "frame_freq": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SessionConfig::from_json_str(r#"{ "max_clients": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn password_for_missing_group_is_rejected() {
        let mut config = SessionConfig {
            max_groups: 2,
            ..Default::default()
        };
        config.group_passwords.insert(5, "x".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_passwords_count_as_none() {
        let mut config = SessionConfig {
            session_password: Some(String::new()),
            ..Default::default()
        };
        config.group_passwords.insert(0, String::new());
        assert_eq!(config.session_password(), None);
        assert_eq!(config.group_password(0), None);
    }

    #[test]
    fn storage_keys_generated_once() {
        let mut config = SessionConfig::default();
        assert!(config.ensure_storage_keys(&mut OsEntropy));
        let first = config.clone();
        assert!(!config.ensure_storage_keys(&mut OsEntropy));
        assert_eq!(config, first);
        assert_eq!(config.server_id.len(), SERVER_ID_LENGTH * 2);
        config.storage_keys().unwrap();
    }

    #[test]
    fn load_and_save_through_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "server_port": 4100, "dedicated": true }}"#).unwrap();
        let mut config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.server_port, 4100);
        assert!(config.dedicated);

        config.ensure_storage_keys(&mut OsEntropy);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SessionConfig::load(&dir.path().join("absent.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
