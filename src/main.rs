use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use chrono::Utc;
use std::sync::Arc;

use simplefeed::api::{self, AppState};
use simplefeed::auth::AuthService;
use simplefeed::config::Config;
use simplefeed::events::FeedHub;
use simplefeed::models::{User, UserRole};
use simplefeed::store::Store;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Arc::new(Config::from_env());

    // Initialize store
    let store = match Store::new(&config.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log::error!("Failed to open database {}: {}", config.database_path, e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    // Initialize auth service
    let auth_service = Arc::new(
        AuthService::new(config.jwt_secret.clone(), store.clone())
            .with_session_days(config.session_days),
    );

    // Live listener fan-out
    let feed = Arc::new(FeedHub::new(config.feed_channel_capacity));

    seed_owner(&store, &auth_service, &config);

    match store.purge_expired_sessions(Utc::now()) {
        Ok(0) => {}
        Ok(n) => log::info!("Removed {} expired session(s)", n),
        Err(e) => log::warn!("Failed to purge expired sessions: {}", e),
    }

    log::info!("Database: {}", config.database_path);
    log::info!("Starting simplefeed server on port {}", config.port);

    let port = config.port;
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            // Registered on its own for the auth extractor
            .app_data(web::Data::new(auth_service.clone()))
            .app_data(web::Data::new(AppState {
                store: store.clone(),
                auth_service: auth_service.clone(),
                feed: feed.clone(),
                config: config.clone(),
            }))
            .configure(api::configure_routes(&config))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

/// Create the feed owner from configuration when the database has no users yet
fn seed_owner(store: &Arc<Store>, auth_service: &Arc<AuthService>, config: &Config) {
    let (username, password) = match (&config.owner_username, &config.owner_password) {
        (Some(u), Some(p)) => (u.clone(), p.clone()),
        _ => {
            if store.get_owner().is_err() {
                log::warn!("OWNER_USERNAME/OWNER_PASSWORD not set and no owner exists; nobody can log in");
            }
            return;
        }
    };

    match store.count_users() {
        Ok(0) => {}
        Ok(_) => return,
        Err(e) => {
            log::error!("Failed to count users: {}", e);
            return;
        }
    }

    log::info!("Creating owner user from environment: {}", username);
    let password_hash = match auth_service.hash_password(&password) {
        Ok(h) => h,
        Err(e) => {
            log::error!("Failed to hash owner password: {}", e);
            return;
        }
    };

    let mut owner = User {
        id: String::new(),
        display_name: config
            .owner_display_name
            .clone()
            .unwrap_or_else(|| username.clone()),
        username,
        password_hash,
        role: UserRole::Owner,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    match store.create_user(&mut owner) {
        Ok(_) => log::info!("Owner user created successfully"),
        Err(e) => log::error!("Failed to create owner user: {}", e),
    }
}
