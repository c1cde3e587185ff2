use actix_web::error::InternalError;
use actix_web::{web, HttpResponse, Responder, ResponseError};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{require_owner, AuthService, AuthUser};
use crate::config::Config;
use crate::events::{event_stream, FeedEvent, FeedEventType, FeedHub};
use crate::feed::assemble_feed;
use crate::images::build_record;
use crate::models::*;
use crate::store::{Store, StoreError, StoreResult};

pub struct AppState {
    pub store: Arc<Store>,
    pub auth_service: Arc<AuthService>,
    pub feed: Arc<FeedHub>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Feed items for the given posts, with their comments attached
    fn feed_items(&self, posts: Vec<Post>) -> StoreResult<Vec<FeedItem>> {
        let ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();
        let comments = self.store.list_comments_for_posts(&ids)?;
        Ok(assemble_feed(posts, comments, Utc::now()))
    }

    fn feed_item(&self, post: Post) -> StoreResult<FeedItem> {
        let comments = self.store.list_comments(&post.id)?;
        let mut items = assemble_feed(vec![post], comments, Utc::now());
        items
            .pop()
            .ok_or_else(|| StoreError::NotFound("Post".to_string()))
    }
}

fn server_error(context: &str, e: impl std::fmt::Display) -> HttpResponse {
    log::error!("{}: {}", context, e);
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(format!("{}: {}", context, e)))
}

fn not_found(what: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ApiResponse::<()>::error(format!("{} not found", what)))
}

fn bad_request(msg: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ApiResponse::<()>::error(msg))
}

// ==================== Health Check ====================

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    })))
}

// ==================== Auth Endpoints ====================

pub async fn auth_status(state: web::Data<AppState>) -> impl Responder {
    // Single-owner feed: the owner is configured at startup, nobody registers
    let has_owner = state.store.get_owner().is_ok();
    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "hasOwner": has_owner,
        "registrationEnabled": false
    })))
}

pub async fn login(
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> impl Responder {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return bad_request("Please fill in all fields");
    }

    let user = match state.store.get_user_by_username(body.username.trim()) {
        Ok(u) => u,
        Err(StoreError::NotFound(_)) => {
            return HttpResponse::Unauthorized().json(ApiResponse::<()>::error("Invalid username or password"));
        }
        Err(e) => return server_error("Login failed", e),
    };

    let valid = state.auth_service
        .verify_password(&body.password, &user.password_hash)
        .unwrap_or(false);

    if !valid {
        return HttpResponse::Unauthorized().json(ApiResponse::<()>::error("Invalid username or password"));
    }

    let token = match state.auth_service.start_session(&user) {
        Ok(t) => t,
        Err(e) => return server_error("Failed to start session", e),
    };

    log::info!("User {} logged in", user.username);
    HttpResponse::Ok().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn logout(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    match state.auth_service.end_session(&auth_user.session_id) {
        Ok(_) => HttpResponse::NoContent().finish(),
        Err(e) => server_error("Failed to end session", e),
    }
}

pub async fn get_current_user(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    match state.store.get_user(&auth_user.user_id) {
        Ok(user) => HttpResponse::Ok().json(ApiResponse::success(user)),
        Err(StoreError::NotFound(_)) => not_found("User"),
        Err(e) => server_error("Failed to get user", e),
    }
}

// ==================== Profile Endpoint ====================

pub async fn get_profile(state: web::Data<AppState>) -> impl Responder {
    let name = match state.store.get_owner() {
        Ok(owner) => owner.display_name,
        Err(StoreError::NotFound(_)) => String::new(),
        Err(e) => return server_error("Failed to load profile", e),
    };

    let profile_image = match state.store.current_image(ImageKind::Profile) {
        Ok(img) => img.map(ImageView::from),
        Err(e) => return server_error("Failed to load profile image", e),
    };
    let cover_image = match state.store.current_image(ImageKind::Cover) {
        Ok(img) => img.map(ImageView::from),
        Err(e) => return server_error("Failed to load cover image", e),
    };

    HttpResponse::Ok().json(ApiResponse::success(Profile {
        name,
        profile_image,
        cover_image,
    }))
}

// ==================== Posts Endpoints ====================

#[derive(Deserialize)]
pub struct ListPostsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list_posts(
    state: web::Data<AppState>,
    query: web::Query<ListPostsQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let posts = match state.store.list_posts(limit, offset) {
        Ok(p) => p,
        Err(e) => return server_error("Failed to list posts", e),
    };
    let total = match state.store.count_posts() {
        Ok(t) => t,
        Err(e) => return server_error("Failed to count posts", e),
    };

    match state.feed_items(posts) {
        Ok(items) => HttpResponse::Ok().json(ApiResponse::success(PaginatedResponse {
            items,
            total,
            limit,
            offset,
        })),
        Err(e) => server_error("Failed to load comments", e),
    }
}

pub async fn get_post(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();
    let post = match state.store.get_post(&id) {
        Ok(p) => p,
        Err(StoreError::NotFound(_)) => return not_found("Post"),
        Err(e) => return server_error("Failed to get post", e),
    };

    match state.feed_item(post) {
        Ok(item) => HttpResponse::Ok().json(ApiResponse::success(item)),
        Err(e) => server_error("Failed to load comments", e),
    }
}

pub async fn create_post(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<CreatePostRequest>,
) -> impl Responder {
    if body.content.trim().is_empty() {
        return bad_request("Post content cannot be empty");
    }

    let mut post = Post {
        id: String::new(),
        content: body.content.clone(),
        author: auth_user.display_name.clone(),
        likes: 0,
        dislikes: 0,
        comment_count: 0,
        created_at: Utc::now(),
    };

    match state.store.create_post(&mut post) {
        Ok(_) => {
            state.feed.publish(FeedEvent::new(FeedEventType::PostCreated, Some(post.id.as_str()), &post));
            HttpResponse::Created().json(ApiResponse::success(post))
        }
        Err(e) => server_error("Failed to create post", e),
    }
}

pub async fn delete_post(
    state: web::Data<AppState>,
    _auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();
    match state.store.delete_post(&id) {
        Ok(removed_comments) => {
            log::info!("Deleted post {} with {} comment(s)", id, removed_comments);
            state.feed.publish(FeedEvent::new(
                FeedEventType::PostDeleted,
                Some(id.as_str()),
                &serde_json::json!({ "removed_comments": removed_comments }),
            ));
            HttpResponse::NoContent().finish()
        }
        Err(StoreError::NotFound(_)) => not_found("Post"),
        Err(e) => server_error("Failed to delete post", e),
    }
}

async fn react(state: &AppState, id: &str, reaction: Reaction, delta: i64) -> HttpResponse {
    match state.store.adjust_reaction(id, reaction, delta) {
        Ok(post) => {
            state.feed.publish(FeedEvent::new(FeedEventType::PostUpdated, Some(post.id.as_str()), &post));
            HttpResponse::Ok().json(ApiResponse::success(post))
        }
        Err(StoreError::NotFound(_)) => not_found("Post"),
        Err(e) => server_error("Failed to update reaction", e),
    }
}

pub async fn like_post(state: web::Data<AppState>, _auth_user: AuthUser, path: web::Path<String>) -> impl Responder {
    react(&state, &path.into_inner(), Reaction::Like, 1).await
}

pub async fn unlike_post(state: web::Data<AppState>, _auth_user: AuthUser, path: web::Path<String>) -> impl Responder {
    react(&state, &path.into_inner(), Reaction::Like, -1).await
}

pub async fn dislike_post(state: web::Data<AppState>, _auth_user: AuthUser, path: web::Path<String>) -> impl Responder {
    react(&state, &path.into_inner(), Reaction::Dislike, 1).await
}

pub async fn undislike_post(state: web::Data<AppState>, _auth_user: AuthUser, path: web::Path<String>) -> impl Responder {
    react(&state, &path.into_inner(), Reaction::Dislike, -1).await
}

// ==================== Comments Endpoints ====================

pub async fn list_comments(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let post_id = path.into_inner();
    if let Err(e) = state.store.get_post(&post_id) {
        return match e {
            StoreError::NotFound(_) => not_found("Post"),
            e => server_error("Failed to get post", e),
        };
    }

    match state.store.list_comments(&post_id) {
        Ok(comments) => HttpResponse::Ok().json(ApiResponse::success(comments)),
        Err(e) => server_error("Failed to list comments", e),
    }
}

pub async fn create_comment(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<CreateCommentRequest>,
) -> impl Responder {
    if body.content.trim().is_empty() {
        return bad_request("Comment content cannot be empty");
    }

    let mut comment = Comment {
        id: String::new(),
        post_id: path.into_inner(),
        content: body.content.clone(),
        author: auth_user.display_name.clone(),
        author_id: auth_user.user_id.clone(),
        created_at: Utc::now(),
    };

    match state.store.create_comment(&mut comment) {
        Ok(_) => {
            state.feed.publish(FeedEvent::new(FeedEventType::CommentCreated, Some(comment.id.as_str()), &comment));
            HttpResponse::Created().json(ApiResponse::success(comment))
        }
        Err(StoreError::NotFound(_)) => not_found("Post"),
        Err(e) => server_error("Failed to create comment", e),
    }
}

pub async fn delete_comment(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (post_id, comment_id) = path.into_inner();

    let comment = match state.store.get_comment(&comment_id) {
        Ok(c) if c.post_id == post_id => c,
        Ok(_) | Err(StoreError::NotFound(_)) => return not_found("Comment"),
        Err(e) => return server_error("Failed to get comment", e),
    };

    // Only the author may remove a comment
    if comment.author_id != auth_user.user_id {
        return HttpResponse::Forbidden().json(ApiResponse::<()>::error("You can only delete your own comments"));
    }

    match state.store.delete_comment(&post_id, &comment_id) {
        Ok(_) => {
            state.feed.publish(FeedEvent::new(
                FeedEventType::CommentDeleted,
                Some(comment_id.as_str()),
                &serde_json::json!({ "post_id": post_id }),
            ));
            HttpResponse::NoContent().finish()
        }
        Err(StoreError::NotFound(_)) => not_found("Comment"),
        Err(e) => server_error("Failed to delete comment", e),
    }
}

// ==================== Live Feed ====================

pub async fn feed_stream(state: web::Data<AppState>) -> impl Responder {
    // Subscribe before reading the snapshot so no change falls in between
    let receiver = state.feed.subscribe();

    let posts = match state.store.list_posts(100, 0) {
        Ok(p) => p,
        Err(e) => return server_error("Failed to list posts", e),
    };
    let items = match state.feed_items(posts) {
        Ok(items) => items,
        Err(e) => return server_error("Failed to load comments", e),
    };

    let snapshot = FeedEvent::new(FeedEventType::Snapshot, None, &items);
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(event_stream(snapshot, receiver))
}

// ==================== Images Endpoints ====================

#[derive(Deserialize)]
pub struct ListImagesQuery {
    kind: Option<String>,
}

pub async fn list_images(
    state: web::Data<AppState>,
    query: web::Query<ListImagesQuery>,
) -> impl Responder {
    let kind = match query.kind.as_deref() {
        None | Some("") => None,
        Some(k) => match ImageKind::parse(k) {
            Some(kind) => Some(kind),
            None => return bad_request(format!("Unknown image kind: {}", k)),
        },
    };

    match state.store.list_images(kind) {
        Ok(images) => {
            let views: Vec<ImageView> = images.into_iter().map(ImageView::from).collect();
            HttpResponse::Ok().json(ApiResponse::success(views))
        }
        Err(e) => server_error("Failed to list images", e),
    }
}

pub async fn current_image(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let raw = path.into_inner();
    let kind = match ImageKind::parse(&raw) {
        Some(k) => k,
        None => return bad_request(format!("Unknown image kind: {}", raw)),
    };

    match state.store.current_image(kind) {
        Ok(Some(image)) => HttpResponse::Ok().json(ApiResponse::success(ImageView::from(image))),
        Ok(None) => not_found("Image"),
        Err(e) => server_error("Failed to get image", e),
    }
}

pub async fn get_image(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();
    match state.store.get_image(&id) {
        Ok(image) => HttpResponse::Ok().json(ApiResponse::success(ImageView::from(image))),
        Err(StoreError::NotFound(_)) => not_found("Image"),
        Err(e) => server_error("Failed to get image", e),
    }
}

pub async fn get_image_raw(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let id = path.into_inner();
    match state.store.get_image(&id) {
        Ok(image) => match image.image_url {
            Some(url) => HttpResponse::Found()
                .insert_header(("Location", url))
                .finish(),
            None => HttpResponse::Ok()
                .content_type(image.content_type)
                .body(image.data),
        },
        Err(StoreError::NotFound(_)) => HttpResponse::NotFound().finish(),
        Err(e) => {
            log::error!("Failed to read image {}: {}", id, e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub async fn upload_image(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<UploadImageRequest>,
) -> impl Responder {
    if let Err(resp) = require_owner(&auth_user) {
        return resp;
    }

    let mut image = match build_record(&body, state.config.max_image_bytes) {
        Ok(img) => img,
        Err(e) => return bad_request(e.to_string()),
    };

    match state.store.create_image(&mut image) {
        Ok(_) => {
            log::info!("Stored {} image {} ({} bytes)", image.kind.as_str(), image.id, image.size);
            let view = ImageView::from(image);
            state.feed.publish(FeedEvent::new(FeedEventType::ImageUploaded, Some(view.image.id.as_str()), &view));
            HttpResponse::Created().json(ApiResponse::success(view))
        }
        Err(e) => server_error("Failed to upload image", e),
    }
}

pub async fn delete_image(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = require_owner(&auth_user) {
        return resp;
    }

    let id = path.into_inner();
    match state.store.delete_image(&id) {
        Ok(_) => {
            state.feed.publish(FeedEvent::new(FeedEventType::ImageDeleted, Some(id.as_str()), &()));
            HttpResponse::NoContent().finish()
        }
        Err(StoreError::NotFound(_)) => not_found("Image"),
        Err(e) => server_error("Failed to delete image", e),
    }
}

// ==================== Route Configuration ====================

/// Room for the JSON fields around an encoded image
const JSON_BODY_HEADROOM: usize = 64 * 1024;

/// Base64 inflates uploads by a third
pub fn json_body_limit(max_image_bytes: usize) -> usize {
    max_image_bytes.saturating_mul(4) / 3 + JSON_BODY_HEADROOM
}

/// JSON extractor settings; rejected bodies still get the error envelope
pub fn json_config(max_image_bytes: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(json_body_limit(max_image_bytes))
        .error_handler(|err, _req| {
            let response = HttpResponse::build(err.status_code())
                .json(ApiResponse::<()>::error(err.to_string()));
            InternalError::from_response(err, response).into()
        })
}

pub fn configure_routes(config: &Config) -> impl FnOnce(&mut web::ServiceConfig) {
    let json = json_config(config.max_image_bytes);
    move |cfg| configure_with(cfg, json)
}

fn configure_with(cfg: &mut web::ServiceConfig, json: web::JsonConfig) {
    cfg
        .app_data(json)

        // Health check
        .route("/health", web::get().to(health))

        // Auth
        .route("/api/auth/status", web::get().to(auth_status))
        .route("/api/auth/login", web::post().to(login))
        .route("/api/auth/logout", web::post().to(logout))
        .route("/api/auth/me", web::get().to(get_current_user))

        // Profile
        .route("/api/profile", web::get().to(get_profile))

        // Posts
        .route("/api/posts", web::get().to(list_posts))
        .route("/api/posts", web::post().to(create_post))
        .route("/api/posts/{id}", web::get().to(get_post))
        .route("/api/posts/{id}", web::delete().to(delete_post))
        .route("/api/posts/{id}/like", web::post().to(like_post))
        .route("/api/posts/{id}/like", web::delete().to(unlike_post))
        .route("/api/posts/{id}/dislike", web::post().to(dislike_post))
        .route("/api/posts/{id}/dislike", web::delete().to(undislike_post))

        // Comments
        .route("/api/posts/{id}/comments", web::get().to(list_comments))
        .route("/api/posts/{id}/comments", web::post().to(create_comment))
        .route("/api/posts/{id}/comments/{comment_id}", web::delete().to(delete_comment))

        // Live feed
        .route("/api/feed/stream", web::get().to(feed_stream))

        // Images
        .route("/api/images", web::get().to(list_images))
        .route("/api/images", web::post().to(upload_image))
        .route("/api/images/current/{kind}", web::get().to(current_image))
        .route("/api/images/{id}", web::get().to(get_image))
        .route("/api/images/{id}", web::delete().to(delete_image))
        .route("/api/images/{id}/raw", web::get().to(get_image_raw));
}
