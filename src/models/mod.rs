use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The single account that owns the feed, plus any member accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Owner,
    Member,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Owner => "owner",
            UserRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "owner" => UserRole::Owner,
            _ => UserRole::Member,
        }
    }
}

/// Session represents an active login; tokens are only honoured while it exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Post is a short text note on the feed.
/// Counters are owned by the store and only change through counter updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    pub author: String,
    pub likes: i64,
    pub dislikes: i64,
    pub comment_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Comment attached to a Post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub content: String,
    pub author: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

/// Reaction counters a post carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Like,
    Dislike,
}

impl Reaction {
    pub fn column(&self) -> &'static str {
        match self {
            Reaction::Like => "likes",
            Reaction::Dislike => "dislikes",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Profile,
    Cover,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Profile => "profile",
            ImageKind::Cover => "cover",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "profile" => Some(ImageKind::Profile),
            "cover" => Some(ImageKind::Cover),
            _ => None,
        }
    }
}

/// ImageRecord stores either the image bytes or a reference to an external URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub kind: ImageKind,
    #[serde(skip_serializing, default)]
    pub data: Vec<u8>,
    pub image_url: Option<String>,
    pub content_type: String,
    pub file_name: String,
    pub size: i64,
    pub uploaded_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Where a client should load the image from
    pub fn source(&self) -> String {
        match &self.image_url {
            Some(url) => url.clone(),
            None => format!("/api/images/{}/raw", self.id),
        }
    }
}

/// Image metadata as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct ImageView {
    #[serde(flatten)]
    pub image: ImageRecord,
    pub src: String,
}

impl From<ImageRecord> for ImageView {
    fn from(image: ImageRecord) -> Self {
        let src = image.source();
        Self { image, src }
    }
}

/// A comment with display times
#[derive(Debug, Clone, Serialize)]
pub struct CommentView {
    #[serde(flatten)]
    pub comment: Comment,
    pub relative_time: String,
}

/// A post with its comments grouped underneath, as the feed shows it
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    #[serde(flatten)]
    pub post: Post,
    pub exact_time: String,
    pub relative_time: String,
    pub comments: Vec<CommentView>,
}

#[derive(Debug, Serialize)]
pub struct Profile {
    pub name: String,
    pub profile_image: Option<ImageView>,
    pub cover_image: Option<ImageView>,
}

// Request/Response types for API
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadImageRequest {
    pub kind: ImageKind,
    pub image_data: Option<String>,
    pub content_type: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
