use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Runtime settings, read from the environment (and `.env`) at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub jwt_secret: String,
    pub owner_username: Option<String>,
    pub owner_password: Option<String>,
    pub owner_display_name: Option<String>,
    pub session_days: i64,
    pub max_image_bytes: usize,
    pub feed_channel_capacity: usize,
}

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 1024 * 1024;

/// Longest session lifetime accepted from the environment
pub const MAX_SESSION_DAYS: i64 = 3650;

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8069,
            database_path: "simplefeed.db".to_string(),
            jwt_secret: "default_jwt_secret_change_me".to_string(),
            owner_username: None,
            owner_password: None,
            owner_display_name: None,
            session_days: 7,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            feed_channel_capacity: 64,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup; unset or invalid values keep the default
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let jwt_secret = lookup("JWT_SECRET").unwrap_or_else(|| {
            log::warn!("JWT_SECRET not set, using default (not secure for production!)");
            defaults.jwt_secret.clone()
        });

        Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            database_path: lookup("DATABASE_PATH").unwrap_or(defaults.database_path),
            jwt_secret,
            owner_username: lookup("OWNER_USERNAME").filter(|v| !v.is_empty()),
            owner_password: lookup("OWNER_PASSWORD").filter(|v| !v.is_empty()),
            owner_display_name: lookup("OWNER_DISPLAY_NAME").filter(|v| !v.is_empty()),
            session_days: in_range_or(
                parse_or(&lookup, "SESSION_DAYS", defaults.session_days),
                "SESSION_DAYS",
                1..=MAX_SESSION_DAYS,
                defaults.session_days,
            ),
            max_image_bytes: parse_or(&lookup, "MAX_IMAGE_BYTES", defaults.max_image_bytes),
            feed_channel_capacity: parse_or(
                &lookup,
                "FEED_CHANNEL_CAPACITY",
                defaults.feed_channel_capacity,
            )
            .max(1),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            log::warn!("Invalid {} value '{}': {}, using default: {}", key, raw, e, default);
            default
        }),
        None => default,
    }
}

fn in_range_or<T>(value: T, key: &str, range: RangeInclusive<T>, default: T) -> T
where
    T: PartialOrd + Display,
{
    if range.contains(&value) {
        value
    } else {
        log::warn!(
            "{} value {} outside {}..={}, using default: {}",
            key,
            value,
            range.start(),
            range.end(),
            default
        );
        default
    }
}
