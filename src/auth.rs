//! Credential store for a single wrapped account.
//!
//! An account may be reachable through a bearer token (Graph API) and a
//! session cookie (Private API) at the same time. Each scheme is held as an
//! independent [`CredentialSet`]; a scheme is available iff its secret is
//! non-empty. Sets are only ever replaced wholesale through
//! [`CredentialStore::update`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{ErrorCode, ErrorInfo};

/// Header map produced for one outbound request.
pub type Headers = BTreeMap<String, String>;

/// Application id the Private API expects from the official app.
pub const PRIVATE_APP_ID: &str = "936619743392459";

/// User agent presented on the session-cookie scheme.
pub const PRIVATE_USER_AGENT: &str =
    "Instagram 309.1.0.41.113 Android (33/13; 420dpi; 1080x2400; samsung; SM-G991B; o1s; exynos2100; en_US; 541635890)";

/// Authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// `Authorization: Bearer <token>` (Graph API).
    TokenBearer,
    /// `Cookie: sessionid=<id>` plus device headers (Private API).
    SessionCookie,
}

impl Scheme {
    /// All schemes, in default preference order.
    pub const ALL: [Scheme; 2] = [Scheme::TokenBearer, Scheme::SessionCookie];

    /// The other scheme.
    pub fn other(self) -> Scheme {
        match self {
            Scheme::TokenBearer => Scheme::SessionCookie,
            Scheme::SessionCookie => Scheme::TokenBearer,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::TokenBearer => f.write_str("token_bearer"),
            Scheme::SessionCookie => f.write_str("session_cookie"),
        }
    }
}

/// Secondary values carried next to a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auxiliary {
    /// CSRF token (session-cookie scheme).
    pub csrf_token: Option<String>,
    /// Numeric user id associated with the secret.
    pub user_id: Option<String>,
    /// When the secret stops being valid.
    pub expires_at: Option<DateTime<Utc>>,
}

/// One usable authentication scheme.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    /// Scheme tag.
    pub scheme: Scheme,
    /// Bearer token or session identifier.
    pub secret: String,
    /// Secondary values.
    pub auxiliary: Auxiliary,
}

impl CredentialSet {
    /// Whether the required secret is present.
    pub fn is_available(&self) -> bool {
        !self.secret.is_empty()
    }
}

// Hand-written so secrets never reach logs.
impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("scheme", &self.scheme)
            .field("secret", &"<redacted>")
            .field("user_id", &self.auxiliary.user_id)
            .field("expires_at", &self.auxiliary.expires_at)
            .finish()
    }
}

/// Credential values as they arrive from configuration.
#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    /// Graph API access token.
    pub access_token: Option<String>,
    /// Expiry of the access token.
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Private API session id.
    pub session_id: Option<String>,
    /// CSRF token for the session.
    pub csrf_token: Option<String>,
    /// Numeric user id for the session.
    pub ds_user_id: Option<String>,
}

/// Public, secret-free view of one scheme.
#[derive(Debug, Clone, Serialize)]
pub struct SchemeStatus {
    /// Scheme tag.
    pub scheme: Scheme,
    /// Secret configured.
    pub available: bool,
    /// Secret past its recorded expiry.
    pub expired: bool,
    /// Recorded expiry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Holds the credential sets for one wrapped account.
pub struct CredentialStore {
    sets: RwLock<HashMap<Scheme, CredentialSet>>,
    clock: SharedClock,
}

impl CredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Populate every scheme whose secret is present in `config`.
    ///
    /// Absent schemes are left unavailable; this never fails.
    pub fn initialize(&self, config: &CredentialConfig) {
        let mut sets = self.sets.write();
        sets.clear();

        if let Some(token) = non_empty(&config.access_token) {
            sets.insert(
                Scheme::TokenBearer,
                CredentialSet {
                    scheme: Scheme::TokenBearer,
                    secret: token,
                    auxiliary: Auxiliary {
                        csrf_token: None,
                        user_id: None,
                        expires_at: config.token_expires_at,
                    },
                },
            );
        }

        if let Some(session) = non_empty(&config.session_id) {
            sets.insert(
                Scheme::SessionCookie,
                CredentialSet {
                    scheme: Scheme::SessionCookie,
                    secret: session,
                    auxiliary: Auxiliary {
                        csrf_token: non_empty(&config.csrf_token),
                        user_id: non_empty(&config.ds_user_id),
                        expires_at: None,
                    },
                },
            );
        }

        tracing::info!(
            token_bearer = sets.contains_key(&Scheme::TokenBearer),
            session_cookie = sets.contains_key(&Scheme::SessionCookie),
            "Credential store initialized"
        );
    }

    /// True iff the scheme's secret is non-empty.
    pub fn is_available(&self, scheme: Scheme) -> bool {
        self.sets
            .read()
            .get(&scheme)
            .map(CredentialSet::is_available)
            .unwrap_or(false)
    }

    /// True iff at least one scheme is available.
    pub fn is_any_available(&self) -> bool {
        Scheme::ALL.iter().any(|s| self.is_available(*s))
    }

    /// True only if the scheme records an expiry and it has passed.
    pub fn is_expired(&self, scheme: Scheme) -> bool {
        let now = self.clock.now();
        self.sets
            .read()
            .get(&scheme)
            .and_then(|set| set.auxiliary.expires_at)
            .map(|expires_at| now >= expires_at)
            .unwrap_or(false)
    }

    /// Build the header set for `scheme`.
    pub fn headers_for(&self, scheme: Scheme) -> Result<Headers, ErrorInfo> {
        let sets = self.sets.read();
        let set = sets
            .get(&scheme)
            .filter(|set| set.is_available())
            .ok_or_else(|| {
                ErrorInfo::new(
                    ErrorCode::CredentialMissing,
                    format!("no credentials configured for {}", scheme),
                )
                .with_scheme(scheme)
            })?;

        let mut headers = Headers::new();
        match scheme {
            Scheme::TokenBearer => {
                headers.insert("Authorization".into(), format!("Bearer {}", set.secret));
            }
            Scheme::SessionCookie => {
                let mut cookie = format!("sessionid={}", set.secret);
                if let Some(csrf) = &set.auxiliary.csrf_token {
                    cookie.push_str(&format!("; csrftoken={}", csrf));
                    headers.insert("X-CSRFToken".into(), csrf.clone());
                }
                if let Some(user_id) = &set.auxiliary.user_id {
                    cookie.push_str(&format!("; ds_user_id={}", user_id));
                }
                headers.insert("Cookie".into(), cookie);
                headers.insert("X-IG-App-ID".into(), PRIVATE_APP_ID.into());
                headers.insert("User-Agent".into(), PRIVATE_USER_AGENT.into());
                headers.insert("X-IG-Device-ID".into(), device_id(&set.secret));
                headers.insert("X-IG-Android-ID".into(), android_id(&set.secret));
            }
        }
        Ok(headers)
    }

    /// Replace a scheme's credential set wholesale.
    ///
    /// An empty `secret` leaves the scheme unavailable.
    pub fn update(&self, scheme: Scheme, secret: impl Into<String>, auxiliary: Option<Auxiliary>) {
        let set = CredentialSet {
            scheme,
            secret: secret.into(),
            auxiliary: auxiliary.unwrap_or_default(),
        };
        tracing::info!(%scheme, available = set.is_available(), "Credential set replaced");
        self.sets.write().insert(scheme, set);
    }

    /// Auxiliary values of a scheme, if it is configured.
    pub fn auxiliary(&self, scheme: Scheme) -> Option<Auxiliary> {
        self.sets.read().get(&scheme).map(|set| set.auxiliary.clone())
    }

    /// Secret-free status of every scheme.
    pub fn status(&self) -> Vec<SchemeStatus> {
        Scheme::ALL
            .iter()
            .map(|&scheme| SchemeStatus {
                scheme,
                available: self.is_available(scheme),
                expired: self.is_expired(scheme),
                expires_at: self
                    .sets
                    .read()
                    .get(&scheme)
                    .and_then(|set| set.auxiliary.expires_at),
            })
            .collect()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Stable UUID-form device identifier derived from a session secret.
pub fn device_id(secret: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, secret.as_bytes()).to_string()
}

/// Stable `android-<16 hex>` identifier derived from a session secret.
pub fn android_id(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("android-{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn bearer_only() -> CredentialConfig {
        CredentialConfig {
            access_token: Some("IGQVJtoken".into()),
            ..Default::default()
        }
    }

    #[test]
    fn absent_schemes_are_unavailable() {
        let store = CredentialStore::new();
        store.initialize(&bearer_only());

        assert!(store.is_available(Scheme::TokenBearer));
        assert!(!store.is_available(Scheme::SessionCookie));
        assert!(store.is_any_available());

        store.initialize(&CredentialConfig {
            access_token: Some("   ".into()),
            ..Default::default()
        });
        assert!(!store.is_any_available());
    }

    #[test]
    fn headers_fail_iff_unavailable() {
        let store = CredentialStore::new();
        store.initialize(&bearer_only());

        let headers = store.headers_for(Scheme::TokenBearer).unwrap();
        assert_eq!(headers["Authorization"], "Bearer IGQVJtoken");

        let err = store.headers_for(Scheme::SessionCookie).unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialMissing);
        assert_eq!(err.details.scheme, Some(Scheme::SessionCookie));
    }

    #[test]
    fn session_headers_carry_cookie_and_device() {
        let store = CredentialStore::new();
        store.initialize(&CredentialConfig {
            session_id: Some("abc%3A123".into()),
            csrf_token: Some("csrf1".into()),
            ds_user_id: Some("42".into()),
            ..Default::default()
        });

        let headers = store.headers_for(Scheme::SessionCookie).unwrap();
        assert_eq!(
            headers["Cookie"],
            "sessionid=abc%3A123; csrftoken=csrf1; ds_user_id=42"
        );
        assert_eq!(headers["X-CSRFToken"], "csrf1");
        assert_eq!(headers["X-IG-App-ID"], PRIVATE_APP_ID);
        assert_eq!(headers["X-IG-Device-ID"], device_id("abc%3A123"));
        assert!(!headers.contains_key("Authorization"));
    }

    #[test]
    fn device_identifiers_are_pure() {
        assert_eq!(device_id("session-a"), device_id("session-a"));
        assert_ne!(device_id("session-a"), device_id("session-b"));
        assert_eq!(device_id("session-a").len(), 36);

        let id = android_id("session-a");
        assert_eq!(id, android_id("session-a"));
        assert_ne!(id, android_id("session-b"));
        assert_eq!(id.len(), "android-".len() + 16);
    }

    #[test]
    fn expiry_only_when_recorded_and_passed() {
        let clock = ManualClock::starting_now();
        let store = CredentialStore::with_clock(Arc::new(clock.clone()));
        store.initialize(&bearer_only());
        assert!(!store.is_expired(Scheme::TokenBearer));

        store.update(
            Scheme::TokenBearer,
            "fresh",
            Some(Auxiliary {
                expires_at: Some(clock.now() + chrono::Duration::seconds(10)),
                ..Default::default()
            }),
        );
        assert!(!store.is_expired(Scheme::TokenBearer));

        clock.advance(chrono::Duration::seconds(10));
        assert!(store.is_expired(Scheme::TokenBearer));
        assert!(!store.is_expired(Scheme::SessionCookie));
    }

    #[test]
    fn update_replaces_wholesale() {
        let store = CredentialStore::new();
        store.initialize(&CredentialConfig {
            session_id: Some("old".into()),
            csrf_token: Some("csrf".into()),
            ..Default::default()
        });

        store.update(Scheme::SessionCookie, "new", None);

        let headers = store.headers_for(Scheme::SessionCookie).unwrap();
        assert_eq!(headers["Cookie"], "sessionid=new");
        assert!(!headers.contains_key("X-CSRFToken"));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let set = CredentialSet {
            scheme: Scheme::TokenBearer,
            secret: "super-secret".into(),
            auxiliary: Auxiliary::default(),
        };
        assert!(!format!("{:?}", set).contains("super-secret"));
    }
}
