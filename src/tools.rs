//! Tool definitions and registry for the MCP server.
//!
//! Every tool call returns a single text block. Successes carry the JSON
//! payload; failures carry `{"success":false,"error":{...}}` and set
//! `isError`. Arguments are validated against the declared schema before a
//! tool runs, so invalid calls never touch the quota tracker or the network.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dispatch::OperationResult;
use crate::error::{Error, ErrorCode, ErrorInfo, Result};
use crate::instagram::SharedClient;
use crate::protocol::{ContentItem, ToolCallResult, ToolDefinition};
use crate::schema;

/// Numeric media id, optionally suffixed with the owner id (`3100_42`).
const MEDIA_ID_PATTERN: &str = "[0-9]{1,32}(_[0-9]{1,32})?";

/// Numeric user id.
const USER_ID_PATTERN: &str = "[0-9]{1,32}";

/// Instagram handle, with an optional leading `@`.
const USERNAME_PATTERN: &str = "@?[A-Za-z0-9._]{1,30}";

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with already validated arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult>;
}

/// Context passed to tools during execution.
pub struct ToolContext {
    /// Instagram client for the configured account.
    pub client: SharedClient,
}

impl ToolContext {
    /// Create a new tool context.
    pub fn new(client: SharedClient) -> Self {
        Self { client }
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Create a registry with the Instagram tool set.
    pub fn new(client: SharedClient) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            context: Arc::new(ToolContext::new(client)),
        };

        registry.register(Arc::new(GetProfileTool));
        registry.register(Arc::new(GetUserMediaTool));
        registry.register(Arc::new(GetMediaTool));
        registry.register(Arc::new(PublishPhotoTool));
        registry.register(Arc::new(LikeMediaTool));
        registry.register(Arc::new(FollowUserTool));
        registry.register(Arc::new(SendDirectMessageTool));
        registry.register(Arc::new(RefreshTokenTool));
        registry.register(Arc::new(AuthStatusTool));
        registry.register(Arc::new(RateLimitStatusTool));
        registry.register(Arc::new(SetRateLimitingTool));

        registry
    }

    /// Get tool definitions, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute a tool by name.
    ///
    /// Only an unknown tool name is an `Err`; every other failure, including
    /// a panicking tool, comes back as an error envelope.
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        if let Err(e) = schema::validate(&tool.definition().input_schema, &arguments) {
            tracing::debug!(tool = name, "Rejected arguments: {}", e);
            return Ok(error_result(&ErrorInfo::new(
                ErrorCode::InvalidParams,
                e.to_string(),
            )));
        }

        let context = self.context.clone();
        let handle = tokio::spawn(async move { tool.execute(arguments, &context).await });

        match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                tracing::error!("Tool {} failed: {}", name, e);
                Ok(error_result(&ErrorInfo::from(e)))
            }
            Err(join) => {
                tracing::error!("Tool {} aborted: {}", name, join);
                Ok(error_result(&ErrorInfo::new(
                    ErrorCode::RequestFailed,
                    format!("tool {} aborted unexpectedly", name),
                )))
            }
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }
}

// ============================================================================
// Result envelope
// ============================================================================

/// Successful tool result carrying `value` as pretty JSON.
pub fn success_result<T: Serialize>(value: &T) -> Result<ToolCallResult> {
    Ok(ToolCallResult {
        content: vec![ContentItem::text(serde_json::to_string_pretty(value)?)],
        is_error: false,
    })
}

/// Failed tool result in the `{success:false,error}` shape.
pub fn error_result(error: &ErrorInfo) -> ToolCallResult {
    let body = json!({ "success": false, "error": error });
    ToolCallResult {
        content: vec![ContentItem::text(
            serde_json::to_string_pretty(&body).unwrap_or_else(|_| error.to_string()),
        )],
        is_error: true,
    }
}

/// Convert an operation outcome into a tool result.
pub fn operation_result<T: Serialize>(outcome: OperationResult<T>) -> Result<ToolCallResult> {
    match outcome {
        OperationResult::Ok(value) => success_result(&value),
        OperationResult::Err(error) => Ok(error_result(&error)),
    }
}

fn parse_args<T: DeserializeOwned>(arguments: serde_json::Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

// ============================================================================
// Read tools
// ============================================================================

/// Tool for fetching a profile.
pub struct GetProfileTool;

#[derive(Debug, Deserialize)]
struct GetProfileArgs {
    /// Handle to look up; defaults to the configured account.
    username: Option<String>,
}

#[async_trait::async_trait]
impl Tool for GetProfileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_get_profile".into(),
            description: "Get profile information for the configured account, or for another account by username.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "username": {
                        "type": "string",
                        "pattern": USERNAME_PATTERN,
                        "description": "Username to look up (omit for the configured account)"
                    }
                },
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: GetProfileArgs = parse_args(arguments)?;
        let username = args.username.as_deref().map(|u| u.trim_start_matches('@'));
        operation_result(context.client.get_profile(username).await)
    }
}

/// Tool for listing recent posts.
pub struct GetUserMediaTool;

#[derive(Debug, Deserialize)]
struct GetUserMediaArgs {
    /// Number of posts to return.
    limit: Option<u32>,
}

#[async_trait::async_trait]
impl Tool for GetUserMediaTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_get_user_media".into(),
            description: "List recent posts of the configured account.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 100,
                        "description": "Number of posts to return (default: 25)"
                    }
                },
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: GetUserMediaArgs = parse_args(arguments)?;
        operation_result(context.client.get_user_media(args.limit.unwrap_or(25)).await)
    }
}

/// Tool for fetching one post.
pub struct GetMediaTool;

#[derive(Debug, Deserialize)]
struct MediaIdArgs {
    /// Media id.
    media_id: String,
}

fn media_id_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "media_id": {
                "type": "string",
                "pattern": MEDIA_ID_PATTERN,
                "description": description
            }
        },
        "required": ["media_id"],
        "additionalProperties": false
    })
}

#[async_trait::async_trait]
impl Tool for GetMediaTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_get_media".into(),
            description: "Get details of a single post.".into(),
            input_schema: media_id_schema("Id of the post"),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: MediaIdArgs = parse_args(arguments)?;
        operation_result(context.client.get_media(&args.media_id).await)
    }
}

// ============================================================================
// Write tools
// ============================================================================

/// Tool for publishing a photo post.
pub struct PublishPhotoTool;

#[derive(Debug, Deserialize)]
struct PublishPhotoArgs {
    /// Publicly reachable JPEG URL.
    image_url: String,
    /// Caption text.
    caption: Option<String>,
}

#[async_trait::async_trait]
impl Tool for PublishPhotoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_publish_photo".into(),
            description: "Publish a photo post from a public image URL. Waits for media processing before publishing. Requires the Graph API token.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "image_url": {
                        "type": "string",
                        "minLength": 8,
                        "maxLength": 2048,
                        "description": "Public URL of the JPEG image"
                    },
                    "caption": {
                        "type": "string",
                        "maxLength": 2200,
                        "description": "Post caption"
                    }
                },
                "required": ["image_url"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: PublishPhotoArgs = parse_args(arguments)?;
        if !args.image_url.starts_with("https://") && !args.image_url.starts_with("http://") {
            return Ok(error_result(&ErrorInfo::new(
                ErrorCode::InvalidParams,
                "image_url must be an http(s) URL",
            )));
        }
        operation_result(
            context
                .client
                .publish_photo(&args.image_url, args.caption.as_deref())
                .await,
        )
    }
}

/// Tool for liking a post.
pub struct LikeMediaTool;

#[async_trait::async_trait]
impl Tool for LikeMediaTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_like_media".into(),
            description: "Like a post. Requires the Private API session.".into(),
            input_schema: media_id_schema("Id of the post to like"),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: MediaIdArgs = parse_args(arguments)?;
        operation_result(context.client.like_media(&args.media_id).await)
    }
}

/// Tool for following a user.
pub struct FollowUserTool;

#[derive(Debug, Deserialize)]
struct FollowUserArgs {
    /// Numeric user id.
    user_id: String,
}

#[async_trait::async_trait]
impl Tool for FollowUserTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_follow_user".into(),
            description: "Follow a user by numeric id. Requires the Private API session.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "user_id": {
                        "type": "string",
                        "pattern": USER_ID_PATTERN,
                        "description": "Numeric id of the user to follow"
                    }
                },
                "required": ["user_id"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: FollowUserArgs = parse_args(arguments)?;
        operation_result(context.client.follow_user(&args.user_id).await)
    }
}

/// Tool for sending a direct message.
pub struct SendDirectMessageTool;

#[derive(Debug, Deserialize)]
struct SendDirectMessageArgs {
    /// Numeric recipient ids.
    recipient_ids: Vec<String>,
    /// Message text.
    text: String,
}

#[async_trait::async_trait]
impl Tool for SendDirectMessageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_send_direct_message".into(),
            description: "Send a text direct message to one or more users. Requires the Private API session.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "recipient_ids": {
                        "type": "array",
                        "minItems": 1,
                        "maxItems": 15,
                        "items": {"type": "string", "pattern": USER_ID_PATTERN},
                        "description": "Numeric ids of the recipients"
                    },
                    "text": {
                        "type": "string",
                        "minLength": 1,
                        "maxLength": 1000,
                        "description": "Message text"
                    }
                },
                "required": ["recipient_ids", "text"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: SendDirectMessageArgs = parse_args(arguments)?;
        operation_result(
            context
                .client
                .send_direct_message(&args.recipient_ids, &args.text)
                .await,
        )
    }
}

// ============================================================================
// Account tools
// ============================================================================

/// Tool for refreshing the long-lived Graph token.
pub struct RefreshTokenTool;

#[async_trait::async_trait]
impl Tool for RefreshTokenTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_refresh_token".into(),
            description: "Refresh the long-lived Graph API access token and start using the new one.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        operation_result(context.client.refresh_token().await)
    }
}

/// Tool for inspecting configured credentials.
pub struct AuthStatusTool;

#[async_trait::async_trait]
impl Tool for AuthStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_auth_status".into(),
            description: "Show which authentication schemes are configured, expired or preferred. Never reveals secrets.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        success_result(&context.client.auth_status())
    }
}

/// Tool for inspecting local quota buckets.
pub struct RateLimitStatusTool;

#[async_trait::async_trait]
impl Tool for RateLimitStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_rate_limit_status".into(),
            description: "Show local quota usage per action category.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        success_result(&context.client.rate_limit_status())
    }
}

/// Tool for toggling local quota enforcement.
pub struct SetRateLimitingTool;

#[derive(Debug, Deserialize)]
struct SetRateLimitingArgs {
    /// New state.
    enabled: bool,
}

#[async_trait::async_trait]
impl Tool for SetRateLimitingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "instagram_set_rate_limiting".into(),
            description: "Enable or disable local quota enforcement. Upstream limits still apply.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "enabled": {
                        "type": "boolean",
                        "description": "Whether local limits are enforced"
                    }
                },
                "required": ["enabled"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: SetRateLimitingArgs = parse_args(arguments)?;
        let quota = context.client.dispatcher().quota();
        quota.set_enabled(args.enabled);
        success_result(&json!({ "success": true, "enabled": quota.is_enabled() }))
    }
}
