//! Command-line and environment configuration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};

use crate::auth::{CredentialConfig, CredentialStore, Scheme};
use crate::clock::{SharedClock, SystemClock};
use crate::dispatch::{Dispatcher, ReqwestTransport, Transport, DEFAULT_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::instagram::{InstagramClient, InstagramSettings, GRAPH_BASE_URL, PRIVATE_BASE_URL};
use crate::quota::{apply_overrides, default_buckets, parse_override, QuotaTracker};

/// Scheme preference as spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemePreference {
    /// Graph API bearer token.
    Graph,
    /// Private API session cookie.
    Private,
}

impl From<SchemePreference> for Scheme {
    fn from(pref: SchemePreference) -> Self {
        match pref {
            SchemePreference::Graph => Scheme::TokenBearer,
            SchemePreference::Private => Scheme::SessionCookie,
        }
    }
}

/// MCP server exposing Instagram behind a quota-aware dispatch layer.
#[derive(Parser, Debug, Clone)]
#[command(name = "apigate-mcp")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Graph API access token.
    #[arg(long, env = "INSTAGRAM_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Expiry of the access token (RFC 3339).
    #[arg(long, env = "INSTAGRAM_TOKEN_EXPIRES_AT")]
    pub token_expires_at: Option<DateTime<Utc>>,

    /// Instagram business account id.
    #[arg(long, env = "INSTAGRAM_ACCOUNT_ID")]
    pub account_id: Option<String>,

    /// Private API session id.
    #[arg(long, env = "INSTAGRAM_SESSION_ID", hide_env_values = true)]
    pub session_id: Option<String>,

    /// CSRF token for the session.
    #[arg(long, env = "INSTAGRAM_CSRF_TOKEN", hide_env_values = true)]
    pub csrf_token: Option<String>,

    /// Numeric user id for the session.
    #[arg(long, env = "INSTAGRAM_DS_USER_ID")]
    pub ds_user_id: Option<String>,

    /// Scheme tried first when an operation supports both.
    #[arg(long, env = "INSTAGRAM_PREFER_SCHEME", value_enum, default_value = "graph")]
    pub prefer_scheme: SchemePreference,

    /// Disable local quota enforcement.
    #[arg(long, env = "INSTAGRAM_DISABLE_RATE_LIMIT")]
    pub no_rate_limit: bool,

    /// Override a quota bucket (CATEGORY=CAPACITY/SECONDS), repeatable.
    #[arg(long = "quota", value_name = "CATEGORY=CAPACITY/SECONDS")]
    pub quota: Vec<String>,

    /// Outbound request timeout in seconds.
    #[arg(long, env = "APIGATE_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Graph API base URL.
    #[arg(long, default_value = GRAPH_BASE_URL)]
    pub graph_base_url: String,

    /// Private API base URL.
    #[arg(long, default_value = PRIVATE_BASE_URL)]
    pub private_base_url: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// Log output file (default: stderr).
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Config {
    /// Credential values for the store.
    pub fn credentials(&self) -> CredentialConfig {
        CredentialConfig {
            access_token: self.access_token.clone(),
            token_expires_at: self.token_expires_at,
            session_id: self.session_id.clone(),
            csrf_token: self.csrf_token.clone(),
            ds_user_id: self.ds_user_id.clone(),
        }
    }

    /// Adapter settings.
    pub fn instagram_settings(&self) -> InstagramSettings {
        InstagramSettings {
            graph_base_url: self.graph_base_url.clone(),
            private_base_url: self.private_base_url.clone(),
            account_id: self.account_id.clone().filter(|id| !id.trim().is_empty()),
            preferred_scheme: self.prefer_scheme.into(),
            ..Default::default()
        }
    }

    /// Build the quota tracker from defaults plus overrides.
    pub fn quota_tracker(&self, clock: SharedClock) -> Result<QuotaTracker> {
        let overrides = self
            .quota
            .iter()
            .map(|raw| parse_override(raw))
            .collect::<Result<Vec<_>>>()?;
        let tracker = QuotaTracker::with_clock(apply_overrides(default_buckets(), overrides), clock);
        tracker.set_enabled(!self.no_rate_limit);
        Ok(tracker)
    }

    /// Build a client over the real network.
    pub fn build_client(&self) -> Result<InstagramClient> {
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout must be at least one second".into()));
        }
        let transport = ReqwestTransport::new(Duration::from_secs(self.timeout_secs))?;
        self.build_client_with(Arc::new(transport), Arc::new(SystemClock))
    }

    /// Build a client over an arbitrary transport and clock.
    pub fn build_client_with(
        &self,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Result<InstagramClient> {
        let credentials = CredentialStore::with_clock(clock.clone());
        credentials.initialize(&self.credentials());
        if !credentials.is_any_available() {
            tracing::warn!("No Instagram credentials configured; network tools will fail");
        }

        let quota = self.quota_tracker(clock.clone())?;
        let dispatcher = Dispatcher::new(
            Arc::new(credentials),
            Arc::new(quota),
            transport,
            clock.clone(),
        );
        Ok(InstagramClient::new(dispatcher, self.instagram_settings(), clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{BucketConfig, Category};

    #[test]
    fn defaults_parse_without_credentials() {
        let config = Config::try_parse_from(["apigate-mcp"]).unwrap();
        assert_eq!(config.prefer_scheme, SchemePreference::Graph);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(!config.no_rate_limit);
    }

    #[test]
    fn stdio_is_the_only_transport() {
        assert!(Config::try_parse_from(["apigate-mcp", "--stdio"]).is_err());
    }

    #[test]
    fn quota_overrides_are_applied() {
        let config = Config::try_parse_from([
            "apigate-mcp",
            "--quota",
            "like=2/60",
            "--quota",
            "reels=1/10",
            "--no-rate-limit",
        ])
        .unwrap();

        let tracker = config.quota_tracker(Arc::new(SystemClock)).unwrap();

        assert!(!tracker.is_enabled());
        assert_eq!(tracker.bucket(&Category::LIKE).unwrap().capacity, 2);
        assert_eq!(tracker.bucket(&Category::new("reels")).unwrap().window_secs, 10);
        assert_eq!(
            tracker.bucket(&Category::READ).unwrap().capacity,
            default_buckets()
                .into_iter()
                .find(|(c, _)| *c == Category::READ)
                .map(|(_, BucketConfig { capacity, .. })| capacity)
                .unwrap()
        );
    }

    #[test]
    fn bad_override_is_config_error() {
        let config = Config::try_parse_from(["apigate-mcp", "--quota", "like"]).unwrap();
        assert!(matches!(
            config.quota_tracker(Arc::new(SystemClock)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn preference_maps_to_scheme() {
        let config =
            Config::try_parse_from(["apigate-mcp", "--prefer-scheme", "private"]).unwrap();
        assert_eq!(
            config.instagram_settings().preferred_scheme,
            Scheme::SessionCookie
        );
    }
}
