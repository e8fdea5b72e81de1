//! Platform credentials from named environment variables.
//!
//! One variable pair per platform:
//! - `ADBANDIT_<PLATFORM>_API_KEY` authorizes polling and bid updates
//! - `ADBANDIT_<PLATFORM>_WEBHOOK_SECRET` verifies inbound webhook bodies
//!
//! A missing API key disables that platform's poller; it never crashes the
//! engine.

use tracing::info;

#[derive(Debug, Clone)]
pub struct PlatformCredentials {
    pub platform: String,
    pub api_key: String,
    pub webhook_secret: Option<String>,
}

fn env_name(platform: &str, suffix: &str) -> String {
    format!(
        "ADBANDIT_{}_{}",
        platform.to_ascii_uppercase().replace([' ', '-'], "_"),
        suffix
    )
}

impl PlatformCredentials {
    /// Load credentials for one platform, or `None` when unconfigured.
    pub fn from_env(platform: &str) -> Option<Self> {
        let api_key = std::env::var(env_name(platform, "API_KEY")).ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        let webhook_secret = std::env::var(env_name(platform, "WEBHOOK_SECRET"))
            .ok()
            .filter(|s| !s.trim().is_empty());
        info!(platform, "platform credentials loaded");
        Some(Self {
            platform: platform.to_string(),
            api_key,
            webhook_secret,
        })
    }

    /// The webhook secret env var name for a platform (for diagnostics).
    pub fn webhook_secret_var(platform: &str) -> String {
        env_name(platform, "WEBHOOK_SECRET")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names_are_uppercased_and_sanitized() {
        assert_eq!(env_name("google", "API_KEY"), "ADBANDIT_GOOGLE_API_KEY");
        assert_eq!(
            env_name("trade-desk", "WEBHOOK_SECRET"),
            "ADBANDIT_TRADE_DESK_WEBHOOK_SECRET"
        );
    }

    #[test]
    fn missing_key_yields_none() {
        assert!(PlatformCredentials::from_env("nonexistent_platform_xyz").is_none());
    }
}
