use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use coursechat::{CurrentUser, StaticCredentials};
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

// Saved sign-in: the bearer token plus who it belongs to

#[derive(Serialize, Deserialize, Clone)]
pub struct Credentials {
    /// Base64 of the bearer token
    token: String,
    pub user: CurrentUser,
}

impl Credentials {
    pub fn new(token: &str, user: CurrentUser) -> Self {
        Credentials {
            token: BASE64.encode(token),
            user,
        }
    }

    pub fn get_token(&self) -> Option<String> {
        let bytes = BASE64.decode(&self.token).ok()?;
        String::from_utf8(bytes).ok().filter(|t| !t.trim().is_empty())
    }

    /// Provider handed to the engine. A token that fails to decode counts as signed out.
    pub fn into_provider(self) -> StaticCredentials {
        let token = self.get_token();
        if token.is_none() {
            warn!("Saved token could not be decoded, continuing unauthenticated");
        }
        StaticCredentials::new(token, Some(self.user))
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the per-user config directory. Only the first call wins.
pub fn set_credentials_path_override(path: PathBuf) {
    if CONFIG_PATH_OVERRIDE.set(path).is_err() {
        warn!("Credentials path already set, ignoring override");
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("coursechat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    let config_path = get_config_path()?;
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(&config_path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!(
        "Credentials saved for user {:?} to {}",
        credentials.user.id,
        config_path.display()
    );
    Ok(())
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(None);
    }

    let mut file = File::open(&config_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!(
        "Loaded credentials for user {:?} from {}",
        credentials.user.id,
        config_path.display()
    );

    Ok(Some(credentials))
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("credentials.json"))
}
