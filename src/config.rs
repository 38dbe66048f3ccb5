// Process configuration, read once from the environment at startup.

use log::{error, info};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Key for the GTFS-RT vehicle positions feed (API_KEY).
    pub feed_api_key: Option<String>,
    /// Key for the static GTFS archive (GTFS_API_KEY, falls back to API_KEY).
    pub static_api_key: Option<String>,
    pub data_dir: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> AppConfig {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let feed_api_key = env::var("API_KEY").ok().filter(|k| !k.is_empty());
        let static_api_key = env::var("GTFS_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| feed_api_key.clone());

        let data_dir = env::var("XTLIVE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push("xtlive");
                path
            });

        AppConfig {
            port,
            feed_api_key,
            static_api_key,
            data_dir,
        }
    }

    /// Logs masked key diagnostics so a misconfigured deployment is visible
    /// without leaking the full keys.
    pub fn log_key_status(&self) {
        match &self.feed_api_key {
            // Char-based slicing: keys are not guaranteed to be ASCII.
            Some(key) if key.chars().count() >= 8 => {
                let chars: Vec<char> = key.chars().collect();
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                info!(
                    "API key loaded. Starts with: {}, ends with: {}, length: {}",
                    head,
                    tail,
                    chars.len()
                );
            }
            Some(_) => info!("API key loaded (short key)"),
            None => error!(
                "❌ API_KEY is not set. The /api/vehicles feed will be unavailable. \
                 Check your environment and make sure it contains a valid API_KEY."
            ),
        }
        if self.static_api_key.is_none() {
            error!(
                "❌ GTFS_API_KEY is not set. Static GTFS downloads are disabled; \
                 the server will fall back to a synthetic dataset."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(key: &str) -> AppConfig {
        AppConfig {
            port: 8080,
            feed_api_key: Some(key.to_string()),
            static_api_key: None,
            data_dir: PathBuf::from("."),
        }
    }

    #[test]
    fn key_masking_handles_multibyte_keys() {
        // Multi-byte chars at both mask boundaries must not panic.
        config_with_key("ååååbetweenåååå").log_key_status();
        config_with_key("日本語のかぎ12345").log_key_status();
        config_with_key("ålm").log_key_status();
    }
}
