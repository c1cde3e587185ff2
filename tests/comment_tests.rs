use actix_web::{test, web, App};
use serde_json::json;
use std::sync::Arc;

use simplefeed::api::{self, AppState};
use simplefeed::auth::AuthService;
use simplefeed::config::Config;
use simplefeed::events::{FeedEventType, FeedHub};
use simplefeed::models::{User, UserRole};
use simplefeed::store::Store;

fn create_app_state(store: Arc<Store>, auth_service: Arc<AuthService>, feed: Arc<FeedHub>) -> AppState {
    AppState {
        store,
        auth_service,
        feed,
        config: Arc::new(Config::default()),
    }
}

/// Helper to create a user and return their auth token
fn create_user_with_token(
    store: &Store,
    auth_service: &AuthService,
    username: &str,
    display_name: &str,
    role: UserRole,
) -> String {
    let mut user = User {
        id: String::new(),
        username: username.to_string(),
        password_hash: auth_service.hash_password("testpass123").unwrap(),
        display_name: display_name.to_string(),
        role,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    store.create_user(&mut user).unwrap();
    auth_service.start_session(&user).unwrap()
}

macro_rules! init_app {
    ($store:expr, $auth_service:expr, $feed:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($auth_service.clone()))
                .app_data(web::Data::new(create_app_state(
                    $store.clone(),
                    $auth_service.clone(),
                    $feed.clone(),
                )))
                .configure(api::configure_routes(&Config::default())),
        )
        .await
    };
}

macro_rules! create_post {
    ($app:expr, $token:expr, $content:expr) => {{
        let req = test::TestRequest::post()
            .uri("/api/posts")
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json(json!({ "content": $content }))
            .to_request();

        let resp: serde_json::Value = test::call_and_read_body_json(&$app, req).await;
        resp["data"]["id"].as_str().unwrap().to_string()
    }};
}

macro_rules! create_comment {
    ($app:expr, $token:expr, $post_id:expr, $content:expr) => {{
        let req = test::TestRequest::post()
            .uri(&format!("/api/posts/{}/comments", $post_id))
            .insert_header(("Authorization", format!("Bearer {}", $token)))
            .set_json(json!({ "content": $content }))
            .to_request();

        let resp: serde_json::Value = test::call_and_read_body_json(&$app, req).await;
        resp["data"]["id"].as_str().unwrap().to_string()
    }};
}

// ==================== Create Comment Tests ====================

#[actix_web::test]
async fn test_create_comment_bumps_counter() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let post_id = create_post!(app, &token, "Comment on me");

    let req = test::TestRequest::post()
        .uri(&format!("/api/posts/{}/comments", post_id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({ "content": "Nice post!" }))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["data"]["content"], "Nice post!");
    assert_eq!(body["data"]["post_id"], post_id);
    assert_eq!(body["data"]["author"], "Rami Sara");

    assert_eq!(store.get_post(&post_id).unwrap().comment_count, 1);
}

#[actix_web::test]
async fn test_blank_comment_rejected() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let post_id = create_post!(app, &token, "Quiet post");

    let req = test::TestRequest::post()
        .uri(&format!("/api/posts/{}/comments", post_id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({ "content": "   " }))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(store.get_post(&post_id).unwrap().comment_count, 0);
    assert!(store.list_comments(&post_id).unwrap().is_empty());
}

#[actix_web::test]
async fn test_comment_on_missing_post() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let req = test::TestRequest::post()
        .uri("/api/posts/nonexistent/comments")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .set_json(json!({ "content": "Hello?" }))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn test_create_comment_requires_auth() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let post_id = create_post!(app, &token, "Members only");

    let req = test::TestRequest::post()
        .uri(&format!("/api/posts/{}/comments", post_id))
        .set_json(json!({ "content": "anonymous" }))
        .to_request();

    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

// ==================== Listing Tests ====================

#[actix_web::test]
async fn test_comments_listed_oldest_first_and_embedded_in_feed() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let first_post = create_post!(app, &token, "First post");
    let second_post = create_post!(app, &token, "Second post");

    create_comment!(app, &token, first_post, "a");
    create_comment!(app, &token, second_post, "x");
    create_comment!(app, &token, first_post, "b");

    let req = test::TestRequest::get()
        .uri(&format!("/api/posts/{}/comments", first_post))
        .to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let contents: Vec<&str> = resp["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["a", "b"]);

    let req = test::TestRequest::get().uri("/api/posts").to_request();
    let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let items = resp["data"]["items"].as_array().unwrap();

    assert_eq!(items[0]["id"], second_post);
    assert_eq!(items[0]["comment_count"], 1);
    assert_eq!(items[0]["comments"].as_array().unwrap().len(), 1);

    assert_eq!(items[1]["id"], first_post);
    assert_eq!(items[1]["comment_count"], 2);
    let embedded: Vec<&str> = items[1]["comments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["content"].as_str().unwrap())
        .collect();
    assert_eq!(embedded, vec!["a", "b"]);
    assert_eq!(items[1]["comments"][0]["relative_time"], "0 minutes ago");
}

#[actix_web::test]
async fn test_list_comments_missing_post() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let app = init_app!(store, auth_service, feed);

    let req = test::TestRequest::get()
        .uri("/api/posts/nonexistent/comments")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

// ==================== Delete Comment Tests ====================

#[actix_web::test]
async fn test_delete_comment_drops_counter() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let post_id = create_post!(app, &token, "Busy post");
    let keep = create_comment!(app, &token, post_id, "keep");
    let drop_id = create_comment!(app, &token, post_id, "drop");
    assert_eq!(store.get_post(&post_id).unwrap().comment_count, 2);

    let mut rx = feed.subscribe();

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}/comments/{}", post_id, drop_id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    assert_eq!(store.get_post(&post_id).unwrap().comment_count, 1);
    let remaining = store.list_comments(&post_id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, keep);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.event_type, FeedEventType::CommentDeleted);
    assert_eq!(event.payload["post_id"], post_id);
}

#[actix_web::test]
async fn test_only_author_deletes_comment() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let owner_token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let guest_token = create_user_with_token(&store, &auth_service, "guest", "Guest", UserRole::Member);
    let app = init_app!(store, auth_service, feed);

    let post_id = create_post!(app, &owner_token, "Owner post");
    let comment_id = create_comment!(app, &owner_token, post_id, "owner's words");

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}/comments/{}", post_id, comment_id))
        .insert_header(("Authorization", format!("Bearer {}", guest_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    assert_eq!(store.get_post(&post_id).unwrap().comment_count, 1);
}

#[actix_web::test]
async fn test_shared_display_name_does_not_grant_delete() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let owner_token = create_user_with_token(&store, &auth_service, "rami", "Rami", UserRole::Owner);
    let namesake_token = create_user_with_token(&store, &auth_service, "rami2", "Rami", UserRole::Member);
    let app = init_app!(store, auth_service, feed);

    let post_id = create_post!(app, &owner_token, "Owner post");
    let comment_id = create_comment!(app, &owner_token, post_id, "mine");

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}/comments/{}", post_id, comment_id))
        .insert_header(("Authorization", format!("Bearer {}", namesake_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    assert!(store.get_comment(&comment_id).is_ok());

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}/comments/{}", post_id, comment_id))
        .insert_header(("Authorization", format!("Bearer {}", owner_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);
}

#[actix_web::test]
async fn test_delete_comment_under_wrong_post() {
    let store = Arc::new(Store::new(":memory:").unwrap());
    let auth_service = Arc::new(AuthService::new("test_secret".to_string(), store.clone()));
    let feed = Arc::new(FeedHub::default());
    let token = create_user_with_token(&store, &auth_service, "rami", "Rami Sara", UserRole::Owner);
    let app = init_app!(store, auth_service, feed);

    let post_a = create_post!(app, &token, "A");
    let post_b = create_post!(app, &token, "B");
    let comment_id = create_comment!(app, &token, post_a, "on A");

    let req = test::TestRequest::delete()
        .uri(&format!("/api/posts/{}/comments/{}", post_b, comment_id))
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    assert_eq!(store.get_post(&post_a).unwrap().comment_count, 1);
    assert_eq!(store.get_post(&post_b).unwrap().comment_count, 0);
}
