//! Instagram adapter: Graph API over a bearer token, Private API over a
//! session cookie.
//!
//! Each operation declares which schemes can serve it. The client picks the
//! preferred scheme when it is usable and supported, and otherwise falls back
//! to the other supported scheme. Upstream payloads are decoded into explicit
//! record types and mapped into the internal [`Profile`] / [`Media`] shapes by
//! pure functions.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{Auxiliary, Scheme, SchemeStatus};
use crate::clock::SharedClock;
use crate::dispatch::{ApiTarget, Call, Dispatcher, OperationResult};
use crate::error::{ErrorCode, ErrorInfo};
use crate::poll::{poll_until, PollResult};
use crate::quota::{Category, QuotaReport};

/// Default Graph API base URL.
pub const GRAPH_BASE_URL: &str = "https://graph.instagram.com/v21.0";

/// Default Private API base URL.
pub const PRIVATE_BASE_URL: &str = "https://i.instagram.com/api/v1";

const PROFILE_FIELDS: &str =
    "id,username,name,biography,followers_count,follows_count,media_count,profile_picture_url,website";

const MEDIA_FIELDS: &str =
    "id,caption,media_type,media_url,permalink,timestamp,like_count,comments_count";

/// Adapter settings.
#[derive(Debug, Clone)]
pub struct InstagramSettings {
    /// Graph API base URL.
    pub graph_base_url: String,
    /// Private API base URL.
    pub private_base_url: String,
    /// Business account id used by account-scoped Graph calls.
    pub account_id: Option<String>,
    /// Scheme tried first when an operation supports both.
    pub preferred_scheme: Scheme,
    /// Delay between media container status checks.
    pub poll_interval: Duration,
    /// Status checks before giving up on a container.
    pub poll_attempts: u32,
}

impl Default for InstagramSettings {
    fn default() -> Self {
        Self {
            graph_base_url: GRAPH_BASE_URL.into(),
            private_base_url: PRIVATE_BASE_URL.into(),
            account_id: None,
            preferred_scheme: Scheme::TokenBearer,
            poll_interval: Duration::from_secs(2),
            poll_attempts: 10,
        }
    }
}

// ============================================================================
// Internal record types
// ============================================================================

/// Account profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    /// Account id.
    pub id: String,
    /// Handle.
    pub username: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    /// Bio text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biography: Option<String>,
    /// Follower count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers: Option<u64>,
    /// Following count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<u64>,
    /// Number of posts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_count: Option<u64>,
    /// Avatar URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture_url: Option<String>,
    /// External link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Scheme that served the data.
    pub source: Scheme,
}

/// One post.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Media {
    /// Media id.
    pub id: String,
    /// Caption text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// IMAGE, VIDEO or CAROUSEL_ALBUM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Direct media URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Public link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    /// Creation time (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Likes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<u64>,
    /// Comments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<u64>,
}

/// Result of a publish flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Published {
    /// Id of the new post.
    pub media_id: String,
    /// Id of the processed container.
    pub container_id: String,
}

/// Result of a social action (like, follow, message).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    /// Action name.
    pub action: &'static str,
    /// Object acted upon.
    pub target: String,
    /// Upstream status string, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Result of a token refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenRefreshed {
    /// New expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Secret-free view of the credential configuration.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    /// Per-scheme status.
    pub schemes: Vec<SchemeStatus>,
    /// Scheme tried first.
    pub preferred_scheme: Scheme,
    /// Whether a business account id is configured.
    pub account_id_configured: bool,
}

// ============================================================================
// Upstream record types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphProfile {
    id: String,
    username: String,
    name: Option<String>,
    biography: Option<String>,
    followers_count: Option<u64>,
    follows_count: Option<u64>,
    media_count: Option<u64>,
    profile_picture_url: Option<String>,
    website: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphDiscovery {
    business_discovery: GraphProfile,
}

#[derive(Debug, Deserialize)]
struct GraphMedia {
    id: String,
    caption: Option<String>,
    media_type: Option<String>,
    media_url: Option<String>,
    permalink: Option<String>,
    timestamp: Option<String>,
    like_count: Option<u64>,
    comments_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GraphList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct GraphId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphContainerStatus {
    status_code: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphTokenRefresh {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PrivateUser {
    pk: Value,
    username: String,
    full_name: Option<String>,
    biography: Option<String>,
    follower_count: Option<u64>,
    following_count: Option<u64>,
    media_count: Option<u64>,
    profile_pic_url: Option<String>,
    external_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrivateUserEnvelope {
    user: PrivateUser,
}

#[derive(Debug, Deserialize)]
struct PrivateCaption {
    text: String,
}

#[derive(Debug, Deserialize)]
struct PrivateImageCandidate {
    url: String,
}

#[derive(Debug, Deserialize)]
struct PrivateImageVersions {
    candidates: Vec<PrivateImageCandidate>,
}

#[derive(Debug, Deserialize)]
struct PrivateMedia {
    id: String,
    caption: Option<PrivateCaption>,
    media_type: Option<u8>,
    code: Option<String>,
    taken_at: Option<i64>,
    like_count: Option<u64>,
    comment_count: Option<u64>,
    image_versions2: Option<PrivateImageVersions>,
}

#[derive(Debug, Deserialize)]
struct PrivateItems {
    items: Vec<PrivateMedia>,
}

#[derive(Debug, Deserialize)]
struct PrivateStatus {
    status: Option<String>,
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn profile_from_graph(p: GraphProfile) -> Profile {
    Profile {
        id: p.id,
        username: p.username,
        full_name: p.name,
        biography: p.biography,
        followers: p.followers_count,
        following: p.follows_count,
        media_count: p.media_count,
        profile_picture_url: p.profile_picture_url,
        website: p.website,
        source: Scheme::TokenBearer,
    }
}

fn profile_from_private(u: PrivateUser) -> Profile {
    Profile {
        id: id_string(&u.pk),
        username: u.username,
        full_name: u.full_name.filter(|n| !n.is_empty()),
        biography: u.biography.filter(|b| !b.is_empty()),
        followers: u.follower_count,
        following: u.following_count,
        media_count: u.media_count,
        profile_picture_url: u.profile_pic_url,
        website: u.external_url.filter(|w| !w.is_empty()),
        source: Scheme::SessionCookie,
    }
}

fn media_from_graph(m: GraphMedia) -> Media {
    Media {
        id: m.id,
        caption: m.caption,
        media_type: m.media_type,
        media_url: m.media_url,
        permalink: m.permalink,
        timestamp: m.timestamp,
        like_count: m.like_count,
        comment_count: m.comments_count,
    }
}

fn media_from_private(m: PrivateMedia) -> Media {
    let media_type = m.media_type.map(|t| {
        match t {
            1 => "IMAGE",
            2 => "VIDEO",
            8 => "CAROUSEL_ALBUM",
            _ => "UNKNOWN",
        }
        .to_string()
    });
    Media {
        id: m.id,
        caption: m.caption.map(|c| c.text),
        media_type,
        media_url: m
            .image_versions2
            .and_then(|v| v.candidates.into_iter().next())
            .map(|c| c.url),
        permalink: m.code.map(|code| format!("https://www.instagram.com/p/{}/", code)),
        timestamp: m
            .taken_at
            .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
            .map(|t| t.to_rfc3339()),
        like_count: m.like_count,
        comment_count: m.comment_count,
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ErrorInfo> {
    serde_json::from_value(value).map_err(|e| {
        ErrorInfo::new(
            ErrorCode::ApiError,
            format!("unexpected response shape: {}", e),
        )
    })
}

/// Ids end up in URL paths and form values, so only digits (and the `_`
/// owner separator for media ids) are accepted.
fn ensure_id(field: &str, value: &str, allow_owner_suffix: bool) -> Result<(), ErrorInfo> {
    let mut parts = value.split('_');
    let valid = parts
        .next()
        .map_or(false, |p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        && match parts.next() {
            None => true,
            Some(owner) => {
                allow_owner_suffix
                    && !owner.is_empty()
                    && owner.bytes().all(|b| b.is_ascii_digit())
                    && parts.next().is_none()
            }
        };
    if valid {
        Ok(())
    } else {
        Err(ErrorInfo::new(
            ErrorCode::InvalidParams,
            format!("{} must be a numeric id", field),
        ))
    }
}

fn ensure_username(username: &str) -> Result<(), ErrorInfo> {
    let valid = (1..=30).contains(&username.len())
        && username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ErrorInfo::new(
            ErrorCode::InvalidParams,
            "username may only contain letters, digits, '.' and '_' (at most 30)",
        ))
    }
}

fn container_poll_result(status: GraphContainerStatus) -> PollResult<()> {
    match status.status_code.as_deref() {
        Some("FINISHED") | Some("PUBLISHED") => PollResult::Done(()),
        Some(code @ ("ERROR" | "EXPIRED")) => PollResult::Failed(
            ErrorInfo::new(
                ErrorCode::ApiError,
                format!(
                    "media processing {}: {}",
                    code.to_lowercase(),
                    status.status.unwrap_or_else(|| "no detail".into())
                ),
            )
            .with_upstream_code(code),
        ),
        _ => PollResult::Pending,
    }
}

// ============================================================================
// Client
// ============================================================================

const GRAPH_ONLY: &[Scheme] = &[Scheme::TokenBearer];
const PRIVATE_ONLY: &[Scheme] = &[Scheme::SessionCookie];
const EITHER: &[Scheme] = &[Scheme::TokenBearer, Scheme::SessionCookie];

/// Instagram client owning the dispatch layer for one account.
pub struct InstagramClient {
    dispatcher: Dispatcher,
    graph: ApiTarget,
    private: ApiTarget,
    settings: InstagramSettings,
    clock: SharedClock,
}

impl InstagramClient {
    /// Create a client.
    pub fn new(dispatcher: Dispatcher, settings: InstagramSettings, clock: SharedClock) -> Self {
        Self {
            graph: ApiTarget::new("graph", settings.graph_base_url.clone()),
            private: ApiTarget::new("private", settings.private_base_url.clone()),
            dispatcher,
            settings,
            clock,
        }
    }

    /// Dispatch layer.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn target(&self, scheme: Scheme) -> &ApiTarget {
        match scheme {
            Scheme::TokenBearer => &self.graph,
            Scheme::SessionCookie => &self.private,
        }
    }

    fn usable(&self, scheme: Scheme) -> bool {
        let credentials = self.dispatcher.credentials();
        credentials.is_available(scheme) && !credentials.is_expired(scheme)
    }

    /// Pick the scheme for an operation supported by `supported`.
    pub fn route(&self, supported: &[Scheme]) -> Result<Scheme, ErrorInfo> {
        let preferred = self.settings.preferred_scheme;
        let chosen = [preferred, preferred.other()]
            .into_iter()
            .filter(|s| supported.contains(s))
            .find(|s| self.usable(*s));

        if let Some(scheme) = chosen {
            if scheme != preferred {
                tracing::debug!(%preferred, fallback = %scheme, "Falling back to alternate scheme");
            }
            return Ok(scheme);
        }

        let credentials = self.dispatcher.credentials();
        if !credentials.is_any_available() {
            return Err(ErrorInfo::new(
                ErrorCode::CredentialMissing,
                "no Instagram credentials configured",
            ));
        }

        if let Some(&expired) = supported
            .iter()
            .find(|s| credentials.is_available(**s) && credentials.is_expired(**s))
        {
            return Err(ErrorInfo::new(
                ErrorCode::CredentialMissing,
                format!("{} credentials expired; refresh them first", expired),
            )
            .with_scheme(expired));
        }

        let names: Vec<String> = supported.iter().map(Scheme::to_string).collect();
        Err(ErrorInfo::new(
            ErrorCode::NotSupported,
            format!(
                "operation requires {} credentials, which are not configured",
                names.join(" or ")
            ),
        )
        .with_scheme(supported[0]))
    }

    fn account_id(&self) -> Result<&str, ErrorInfo> {
        self.settings
            .account_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ErrorInfo::new(
                    ErrorCode::ConfigError,
                    "INSTAGRAM_ACCOUNT_ID is required for Graph API calls",
                )
            })
    }

    fn private_user_id(&self) -> Result<String, ErrorInfo> {
        self.dispatcher
            .credentials()
            .auxiliary(Scheme::SessionCookie)
            .and_then(|aux| aux.user_id)
            .ok_or_else(|| {
                ErrorInfo::new(
                    ErrorCode::ConfigError,
                    "INSTAGRAM_DS_USER_ID is required for this Private API call",
                )
            })
    }

    async fn send(&self, call: Call) -> Result<Value, ErrorInfo> {
        let target = self.target(call.scheme);
        self.dispatcher.execute(target, call).await.into_result()
    }

    /// Profile of the configured account, or of `username` when given.
    pub async fn get_profile(&self, username: Option<&str>) -> OperationResult<Profile> {
        self.get_profile_inner(username).await.into()
    }

    async fn get_profile_inner(&self, username: Option<&str>) -> Result<Profile, ErrorInfo> {
        if let Some(username) = username {
            ensure_username(username)?;
        }
        match self.route(EITHER)? {
            Scheme::TokenBearer => {
                let account = self.account_id()?;
                let call = Call::new(Method::GET, account, Scheme::TokenBearer, Category::READ);
                match username {
                    Some(username) => {
                        let fields = format!(
                            "business_discovery.username({}){{{}}}",
                            username, PROFILE_FIELDS
                        );
                        let value = self.send(call.query("fields", fields)).await?;
                        let discovery: GraphDiscovery = decode(value)?;
                        Ok(profile_from_graph(discovery.business_discovery))
                    }
                    None => {
                        let value = self.send(call.query("fields", PROFILE_FIELDS)).await?;
                        Ok(profile_from_graph(decode(value)?))
                    }
                }
            }
            Scheme::SessionCookie => {
                let path = match username {
                    Some(username) => format!("users/{}/usernameinfo/", username),
                    None => format!("users/{}/info/", self.private_user_id()?),
                };
                let call = Call::new(Method::GET, path, Scheme::SessionCookie, Category::READ);
                let envelope: PrivateUserEnvelope = decode(self.send(call).await?)?;
                Ok(profile_from_private(envelope.user))
            }
        }
    }

    /// Recent posts of the configured account.
    pub async fn get_user_media(&self, limit: u32) -> OperationResult<Vec<Media>> {
        self.get_user_media_inner(limit).await.into()
    }

    async fn get_user_media_inner(&self, limit: u32) -> Result<Vec<Media>, ErrorInfo> {
        match self.route(EITHER)? {
            Scheme::TokenBearer => {
                let path = format!("{}/media", self.account_id()?);
                let call = Call::new(Method::GET, path, Scheme::TokenBearer, Category::READ)
                    .query("fields", MEDIA_FIELDS)
                    .query("limit", limit.to_string());
                let list: GraphList<GraphMedia> = decode(self.send(call).await?)?;
                Ok(list.data.into_iter().map(media_from_graph).collect())
            }
            Scheme::SessionCookie => {
                let path = format!("feed/user/{}/", self.private_user_id()?);
                let call = Call::new(Method::GET, path, Scheme::SessionCookie, Category::READ)
                    .query("count", limit.to_string());
                let items: PrivateItems = decode(self.send(call).await?)?;
                Ok(items
                    .items
                    .into_iter()
                    .take(limit as usize)
                    .map(media_from_private)
                    .collect())
            }
        }
    }

    /// One post by id.
    pub async fn get_media(&self, media_id: &str) -> OperationResult<Media> {
        self.get_media_inner(media_id).await.into()
    }

    async fn get_media_inner(&self, media_id: &str) -> Result<Media, ErrorInfo> {
        ensure_id("media_id", media_id, true)?;
        match self.route(EITHER)? {
            Scheme::TokenBearer => {
                let call = Call::new(Method::GET, media_id, Scheme::TokenBearer, Category::READ)
                    .query("fields", MEDIA_FIELDS);
                Ok(media_from_graph(decode(self.send(call).await?)?))
            }
            Scheme::SessionCookie => {
                let path = format!("media/{}/info/", media_id);
                let call = Call::new(Method::GET, path, Scheme::SessionCookie, Category::READ);
                let items: PrivateItems = decode(self.send(call).await?)?;
                items
                    .items
                    .into_iter()
                    .next()
                    .map(media_from_private)
                    .ok_or_else(|| ErrorInfo::new(ErrorCode::ApiError, "media not found"))
            }
        }
    }

    /// Publish a photo: create a container, wait for processing, publish.
    pub async fn publish_photo(&self, image_url: &str, caption: Option<&str>) -> OperationResult<Published> {
        self.publish_photo_inner(image_url, caption).await.into()
    }

    async fn publish_photo_inner(
        &self,
        image_url: &str,
        caption: Option<&str>,
    ) -> Result<Published, ErrorInfo> {
        self.route(GRAPH_ONLY)?;
        let account = self.account_id()?;

        // Check the publish budget up front so a container is not created in vain.
        self.dispatcher.quota().check(&Category::CONTENT_PUBLISH)?;

        let mut create = Call::new(
            Method::POST,
            format!("{}/media", account),
            Scheme::TokenBearer,
            Category::WRITE,
        )
        .query("image_url", image_url);
        if let Some(caption) = caption {
            create = create.query("caption", caption);
        }
        let container: GraphId = decode(self.send(create).await?)?;
        tracing::info!(container = %container.id, "Media container created");

        let client = self;
        let container_id = container.id.as_str();
        poll_until(
            move || async move {
                let call = Call::new(Method::GET, container_id, Scheme::TokenBearer, Category::READ)
                    .query("fields", "status_code,status");
                match client.send(call).await.and_then(decode::<GraphContainerStatus>) {
                    Ok(status) => container_poll_result(status),
                    Err(e) => PollResult::Failed(e),
                }
            },
            self.settings.poll_interval,
            self.settings.poll_attempts,
        )
        .await?;

        let publish = Call::new(
            Method::POST,
            format!("{}/media_publish", account),
            Scheme::TokenBearer,
            Category::CONTENT_PUBLISH,
        )
        .query("creation_id", container.id.as_str());
        let published: GraphId = decode(self.send(publish).await?)?;
        tracing::info!(media = %published.id, "Media published");

        Ok(Published {
            media_id: published.id,
            container_id: container.id,
        })
    }

    /// Like a post.
    pub async fn like_media(&self, media_id: &str) -> OperationResult<ActionOutcome> {
        if let Err(e) = ensure_id("media_id", media_id, true) {
            return OperationResult::Err(e);
        }
        self.private_action(
            "like",
            media_id,
            format!("media/{}/like/", media_id),
            vec![("media_id".into(), media_id.into())],
            Category::LIKE,
        )
        .await
        .into()
    }

    /// Follow a user by numeric id.
    pub async fn follow_user(&self, user_id: &str) -> OperationResult<ActionOutcome> {
        if let Err(e) = ensure_id("user_id", user_id, false) {
            return OperationResult::Err(e);
        }
        self.private_action(
            "follow",
            user_id,
            format!("friendships/create/{}/", user_id),
            vec![("user_id".into(), user_id.into())],
            Category::FOLLOW,
        )
        .await
        .into()
    }

    /// Send a text direct message to one or more users.
    pub async fn send_direct_message(
        &self,
        recipients: &[String],
        text: &str,
    ) -> OperationResult<ActionOutcome> {
        if recipients.is_empty() {
            return OperationResult::Err(ErrorInfo::new(
                ErrorCode::InvalidParams,
                "at least one recipient is required",
            ));
        }
        if let Some(e) = recipients
            .iter()
            .find_map(|r| ensure_id("recipient_ids", r, false).err())
        {
            return OperationResult::Err(e);
        }
        let form = vec![
            ("recipient_users".into(), format!("[[{}]]", recipients.join(","))),
            ("text".into(), text.into()),
            ("action".into(), "send_item".into()),
            ("client_context".into(), uuid::Uuid::new_v4().to_string()),
        ];
        self.private_action(
            "direct_message",
            &recipients.join(","),
            "direct_v2/threads/broadcast/text/".into(),
            form,
            Category::DIRECT_MESSAGE,
        )
        .await
        .into()
    }

    async fn private_action(
        &self,
        action: &'static str,
        target: &str,
        path: String,
        form: Vec<(String, String)>,
        category: Category,
    ) -> Result<ActionOutcome, ErrorInfo> {
        self.route(PRIVATE_ONLY)?;
        let call = Call::new(Method::POST, path, Scheme::SessionCookie, category).form(form);
        let status: PrivateStatus = decode(self.send(call).await?)?;
        Ok(ActionOutcome {
            action,
            target: target.to_string(),
            status: status.status,
        })
    }

    /// Exchange the current long-lived token for a fresh one.
    pub async fn refresh_token(&self) -> OperationResult<TokenRefreshed> {
        self.refresh_token_inner().await.into()
    }

    async fn refresh_token_inner(&self) -> Result<TokenRefreshed, ErrorInfo> {
        // Expired tokens are still sent here; upstream decides.
        let call = Call::new(
            Method::GET,
            "refresh_access_token",
            Scheme::TokenBearer,
            Category::READ,
        )
        .query("grant_type", "ig_refresh_token");
        let refreshed: GraphTokenRefresh = decode(self.send(call).await?)?;

        let now = self.clock.now();
        let expires_at = refreshed.expires_in.and_then(|secs| {
            let at = chrono::Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
            if at.is_none() {
                tracing::warn!(expires_in = secs, "Ignoring out-of-range token lifetime");
            }
            at
        });
        self.dispatcher.credentials().update(
            Scheme::TokenBearer,
            refreshed.access_token,
            Some(Auxiliary {
                expires_at,
                ..Default::default()
            }),
        );
        Ok(TokenRefreshed { expires_at })
    }

    /// Credential configuration, without secrets.
    pub fn auth_status(&self) -> AuthStatus {
        AuthStatus {
            schemes: self.dispatcher.credentials().status(),
            preferred_scheme: self.settings.preferred_scheme,
            account_id_configured: self.account_id().is_ok(),
        }
    }

    /// Quota snapshot.
    pub fn rate_limit_status(&self) -> QuotaReport {
        self.dispatcher.quota().report()
    }
}

/// Shared handle to the client.
pub type SharedClient = Arc<InstagramClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialConfig, CredentialStore};
    use crate::clock::{Clock, ManualClock};
    use crate::dispatch::{HttpResponse, ScriptedTransport};
    use crate::quota::{default_buckets, BucketConfig, QuotaTracker};
    use serde_json::json;

    struct Fixture {
        client: InstagramClient,
        transport: Arc<ScriptedTransport>,
        clock: ManualClock,
    }

    fn fixture(config: CredentialConfig, settings: InstagramSettings) -> Fixture {
        fixture_with_buckets(config, settings, default_buckets())
    }

    fn fixture_with_buckets(
        config: CredentialConfig,
        settings: InstagramSettings,
        buckets: Vec<(Category, BucketConfig)>,
    ) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let credentials = Arc::new(CredentialStore::with_clock(shared.clone()));
        credentials.initialize(&config);
        let quota = Arc::new(QuotaTracker::with_clock(buckets, shared.clone()));
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = Dispatcher::new(credentials, quota, transport.clone(), shared.clone());
        Fixture {
            client: InstagramClient::new(dispatcher, settings, shared),
            transport,
            clock,
        }
    }

    fn token() -> CredentialConfig {
        CredentialConfig {
            access_token: Some("token".into()),
            ..Default::default()
        }
    }

    fn session() -> CredentialConfig {
        CredentialConfig {
            session_id: Some("session".into()),
            csrf_token: Some("csrf".into()),
            ds_user_id: Some("42".into()),
            ..Default::default()
        }
    }

    fn with_account() -> InstagramSettings {
        InstagramSettings {
            account_id: Some("1784".into()),
            poll_interval: Duration::ZERO,
            poll_attempts: 3,
            ..Default::default()
        }
    }

    #[test]
    fn routing_prefers_then_falls_back() {
        let both = CredentialConfig {
            access_token: Some("token".into()),
            ..session()
        };
        let f = fixture(both, InstagramSettings::default());
        assert_eq!(f.client.route(EITHER), Ok(Scheme::TokenBearer));

        let f = fixture(
            session(),
            InstagramSettings::default(),
        );
        assert_eq!(f.client.route(EITHER), Ok(Scheme::SessionCookie));
    }

    #[test]
    fn private_only_operation_without_session_is_not_supported() {
        let f = fixture(token(), with_account());
        let err = f.client.route(PRIVATE_ONLY).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotSupported);

        let f = fixture(CredentialConfig::default(), with_account());
        let err = f.client.route(PRIVATE_ONLY).unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialMissing);
    }

    #[test]
    fn expired_token_falls_back_to_session() {
        let config = CredentialConfig {
            access_token: Some("token".into()),
            token_expires_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
            ..session()
        };
        let f = fixture(config, with_account());
        f.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(f.client.route(EITHER), Ok(Scheme::SessionCookie));

        let err = f.client.route(GRAPH_ONLY).unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialMissing);
        assert!(err.message.contains("expired"));
    }

    #[tokio::test]
    async fn like_without_session_never_hits_network() {
        let f = fixture(token(), with_account());

        let result = f.client.like_media("179").await;

        assert_eq!(result.error().unwrap().code, ErrorCode::NotSupported);
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn graph_profile_requires_account_id() {
        let f = fixture(token(), InstagramSettings::default());

        let result = f.client.get_profile(None).await;

        assert_eq!(result.error().unwrap().code, ErrorCode::ConfigError);
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn graph_profile_is_mapped() {
        let f = fixture(token(), with_account());
        f.transport.push(HttpResponse::new(
            200,
            r#"{"id":"1784","username":"acme","name":"Acme","followers_count":10,"follows_count":3,"media_count":7}"#,
        ));

        let profile = f.client.get_profile(None).await.into_result().unwrap();

        assert_eq!(profile.username, "acme");
        assert_eq!(profile.full_name.as_deref(), Some("Acme"));
        assert_eq!(profile.followers, Some(10));
        assert_eq!(profile.source, Scheme::TokenBearer);
        let request = &f.transport.requests()[0];
        assert!(request.url.ends_with("/1784"));
        assert_eq!(request.query[0].1, PROFILE_FIELDS);
    }

    #[tokio::test]
    async fn private_profile_lookup_by_username() {
        let f = fixture(session(), InstagramSettings::default());
        f.transport.push(HttpResponse::new(
            200,
            r#"{"user":{"pk":987,"username":"someone","full_name":"","follower_count":5},"status":"ok"}"#,
        ));

        let profile = f.client.get_profile(Some("someone")).await.into_result().unwrap();

        assert_eq!(profile.id, "987");
        assert_eq!(profile.full_name, None);
        assert_eq!(profile.source, Scheme::SessionCookie);
        let request = &f.transport.requests()[0];
        assert!(request.url.ends_with("users/someone/usernameinfo/"));
        assert!(request.headers["Cookie"].starts_with("sessionid=session"));
    }

    #[test]
    fn private_media_mapping() {
        let media: PrivateMedia = serde_json::from_value(json!({
            "id": "3_42",
            "caption": {"text": "hello"},
            "media_type": 8,
            "code": "Cabc",
            "taken_at": 0,
            "like_count": 4,
            "image_versions2": {"candidates": [{"url": "https://cdn/x.jpg"}]}
        }))
        .unwrap();

        let media = media_from_private(media);

        assert_eq!(media.caption.as_deref(), Some("hello"));
        assert_eq!(media.media_type.as_deref(), Some("CAROUSEL_ALBUM"));
        assert_eq!(media.permalink.as_deref(), Some("https://www.instagram.com/p/Cabc/"));
        assert_eq!(media.media_url.as_deref(), Some("https://cdn/x.jpg"));
        assert_eq!(media.timestamp.as_deref(), Some("1970-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn publish_waits_for_container() {
        let f = fixture(token(), with_account());
        f.transport
            .push(HttpResponse::new(200, r#"{"id":"c1"}"#))
            .push(HttpResponse::new(200, r#"{"status_code":"IN_PROGRESS","id":"c1"}"#))
            .push(HttpResponse::new(200, r#"{"status_code":"FINISHED","id":"c1"}"#))
            .push(HttpResponse::new(200, r#"{"id":"m1"}"#));

        let published = f
            .client
            .publish_photo("https://img/x.jpg", Some("hi"))
            .await
            .into_result()
            .unwrap();

        assert_eq!(
            published,
            Published {
                media_id: "m1".into(),
                container_id: "c1".into()
            }
        );
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].method, Method::POST);
        assert!(requests[3].url.ends_with("1784/media_publish"));
        let report = f.client.rate_limit_status();
        let publish = report
            .buckets
            .iter()
            .find(|b| b.category == Category::CONTENT_PUBLISH)
            .unwrap();
        assert_eq!(publish.remaining, publish.capacity - 1);
    }

    #[tokio::test]
    async fn publish_reports_processing_error() {
        let f = fixture(token(), with_account());
        f.transport
            .push(HttpResponse::new(200, r#"{"id":"c1"}"#))
            .push(HttpResponse::new(200, r#"{"status_code":"ERROR","status":"bad aspect ratio"}"#));

        let result = f.client.publish_photo("https://img/x.jpg", None).await;

        let err = result.error().unwrap();
        assert_eq!(err.code, ErrorCode::ApiError);
        assert!(err.message.contains("bad aspect ratio"));
        assert_eq!(f.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn publish_gives_up_after_attempt_ceiling() {
        let f = fixture(token(), with_account());
        f.transport.push(HttpResponse::new(200, r#"{"id":"c1"}"#));
        for _ in 0..3 {
            f.transport
                .push(HttpResponse::new(200, r#"{"status_code":"IN_PROGRESS"}"#));
        }

        let result = f.client.publish_photo("https://img/x.jpg", None).await;

        assert_eq!(result.error().unwrap().code, ErrorCode::RequestFailed);
        assert_eq!(f.transport.call_count(), 4);
    }

    #[tokio::test]
    async fn publish_budget_is_checked_before_container() {
        let f = fixture_with_buckets(
            token(),
            with_account(),
            vec![(Category::CONTENT_PUBLISH, BucketConfig::new(0, 86_400))],
        );

        let result = f.client.publish_photo("https://img/x.jpg", None).await;

        assert_eq!(result.error().unwrap().code, ErrorCode::RateLimitLocal);
        assert_eq!(f.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn direct_message_posts_form() {
        let f = fixture(session(), InstagramSettings::default());
        f.transport
            .push(HttpResponse::new(200, r#"{"status":"ok"}"#));

        let outcome = f
            .client
            .send_direct_message(&["1".into(), "2".into()], "hey")
            .await
            .into_result()
            .unwrap();

        assert_eq!(outcome.status.as_deref(), Some("ok"));
        let request = &f.transport.requests()[0];
        match &request.body {
            Some(crate::dispatch::Body::Form(pairs)) => {
                assert!(pairs.contains(&("recipient_users".into(), "[[1,2]]".into())));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_ids_never_reach_transport() {
        let f = fixture(session(), InstagramSettings::default());

        let like = f.client.like_media("1/../../friendships/create/99").await;
        assert_eq!(like.error().unwrap().code, ErrorCode::InvalidParams);

        let follow = f.client.follow_user("99_1").await;
        assert_eq!(follow.error().unwrap().code, ErrorCode::InvalidParams);

        let media = f.client.get_media("17/comments").await;
        assert_eq!(media.error().unwrap().code, ErrorCode::InvalidParams);

        let dm = f
            .client
            .send_direct_message(&["abc]],[[1".into()], "hey")
            .await;
        assert_eq!(dm.error().unwrap().code, ErrorCode::InvalidParams);
        let dm = f.client.send_direct_message(&[], "hey").await;
        assert_eq!(dm.error().unwrap().code, ErrorCode::InvalidParams);

        let profile = f.client.get_profile(Some("../users/1")).await;
        assert_eq!(profile.error().unwrap().code, ErrorCode::InvalidParams);

        assert_eq!(f.transport.call_count(), 0);
        let like = f
            .client
            .rate_limit_status()
            .buckets
            .into_iter()
            .find(|b| b.category == Category::LIKE)
            .unwrap();
        assert_eq!(like.remaining, like.capacity);
    }

    #[test]
    fn id_shapes() {
        assert!(ensure_id("media_id", "3100", true).is_ok());
        assert!(ensure_id("media_id", "3100_42", true).is_ok());
        assert!(ensure_id("user_id", "3100_42", false).is_err());
        assert!(ensure_id("media_id", "3100_", true).is_err());
        assert!(ensure_id("media_id", "1_2_3", true).is_err());
        assert!(ensure_id("media_id", "", true).is_err());
        assert!(ensure_username("some.one_").is_ok());
        assert!(ensure_username(&"a".repeat(31)).is_err());
        assert!(ensure_username("a b").is_err());
    }

    #[tokio::test]
    async fn refresh_survives_out_of_range_lifetime() {
        let f = fixture(token(), with_account());
        f.transport.push(HttpResponse::new(
            200,
            r#"{"access_token":"new-token","expires_in":9223372036854775807}"#,
        ));

        let refreshed = f.client.refresh_token().await.into_result().unwrap();

        assert_eq!(refreshed.expires_at, None);
        let headers = f
            .client
            .dispatcher()
            .credentials()
            .headers_for(Scheme::TokenBearer)
            .unwrap();
        assert_eq!(headers["Authorization"], "Bearer new-token");
    }

    #[tokio::test]
    async fn publish_budget_error_carries_retry_after() {
        let f = fixture_with_buckets(
            token(),
            with_account(),
            vec![(Category::CONTENT_PUBLISH, BucketConfig::new(0, 86_400))],
        );

        let err = f
            .client
            .publish_photo("https://img/x.jpg", None)
            .await
            .error()
            .cloned()
            .unwrap();

        assert_eq!(err.details.category.as_deref(), Some("content_publish"));
        assert_eq!(err.details.retry_after_secs, Some(86_400));
    }

    #[tokio::test]
    async fn refresh_replaces_token() {
        let f = fixture(token(), with_account());
        f.transport.push(HttpResponse::new(
            200,
            r#"{"access_token":"new-token","token_type":"bearer","expires_in":5184000}"#,
        ));

        let refreshed = f.client.refresh_token().await.into_result().unwrap();

        assert_eq!(
            refreshed.expires_at,
            Some(f.clock.now() + chrono::Duration::seconds(5_184_000))
        );
        let headers = f
            .client
            .dispatcher()
            .credentials()
            .headers_for(Scheme::TokenBearer)
            .unwrap();
        assert_eq!(headers["Authorization"], "Bearer new-token");
    }
}
