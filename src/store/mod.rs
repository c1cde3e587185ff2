use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::models::*;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe SQLite store
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                display_name TEXT DEFAULT '',
                role TEXT NOT NULL DEFAULT 'member',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                author TEXT NOT NULL,
                likes INTEGER NOT NULL DEFAULT 0,
                dislikes INTEGER NOT NULL DEFAULT 0,
                comment_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                post_id TEXT NOT NULL,
                content TEXT NOT NULL,
                author TEXT NOT NULL,
                author_id TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                FOREIGN KEY (post_id) REFERENCES posts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                data BLOB,
                image_url TEXT,
                content_type TEXT NOT NULL,
                file_name TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                uploaded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);
            CREATE INDEX IF NOT EXISTS idx_comments_post_id ON comments(post_id);
            CREATE INDEX IF NOT EXISTS idx_images_kind ON images(kind, uploaded_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);
            "#,
        )?;
        Ok(())
    }

    // ==================== User Operations ====================

    pub fn create_user(&self, user: &mut User) -> StoreResult<()> {
        let conn = self.conn()?;
        user.id = Uuid::new_v4().to_string();
        let now = Utc::now();
        user.created_at = now;
        user.updated_at = now;

        conn.execute(
            r#"INSERT INTO users (id, username, password_hash, display_name, role, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                &user.id,
                &user.username,
                &user.password_hash,
                &user.display_name,
                user.role.as_str(),
                format_datetime(&user.created_at),
                format_datetime(&user.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> StoreResult<User> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM users WHERE id = ?1",
            params![id],
            |row| self.row_to_user(row),
        )
        .map_err(|e| not_found_or(e, format!("User {}", id)))
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM users WHERE username = ?1",
            params![username],
            |row| self.row_to_user(row),
        )
        .map_err(|e| not_found_or(e, format!("User {}", username)))
    }

    /// The account whose name and images the feed shows
    pub fn get_owner(&self) -> StoreResult<User> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM users WHERE role = 'owner' ORDER BY created_at ASC LIMIT 1",
            [],
            |row| self.row_to_user(row),
        )
        .map_err(|e| not_found_or(e, "Owner".to_string()))
    }

    pub fn count_users(&self) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    fn row_to_user(&self, row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get("id")?,
            username: row.get("username")?,
            password_hash: row.get("password_hash")?,
            display_name: row.get("display_name")?,
            role: UserRole::parse(&row.get::<_, String>("role")?),
            created_at: parse_datetime(row.get::<_, String>("created_at")?),
            updated_at: parse_datetime(row.get::<_, String>("updated_at")?),
        })
    }

    // ==================== Session Operations ====================

    pub fn create_session(&self, session: &mut Session) -> StoreResult<()> {
        let conn = self.conn()?;
        session.id = Uuid::new_v4().to_string();
        session.created_at = Utc::now();

        conn.execute(
            r#"INSERT INTO sessions (id, user_id, expires_at, created_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![
                &session.id,
                &session.user_id,
                format_datetime(&session.expires_at),
                format_datetime(&session.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Session> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(Session {
                    id: row.get("id")?,
                    user_id: row.get("user_id")?,
                    expires_at: parse_datetime(row.get::<_, String>("expires_at")?),
                    created_at: parse_datetime(row.get::<_, String>("created_at")?),
                })
            },
        )
        .map_err(|e| not_found_or(e, "Session".to_string()))
    }

    pub fn delete_session(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Drop sessions that expired before `now`, returning how many were removed
    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // ==================== Post Operations ====================

    pub fn create_post(&self, post: &mut Post) -> StoreResult<()> {
        let conn = self.conn()?;
        post.id = Uuid::new_v4().to_string();
        post.created_at = Utc::now();
        post.likes = 0;
        post.dislikes = 0;
        post.comment_count = 0;

        conn.execute(
            r#"INSERT INTO posts (id, content, author, likes, dislikes, comment_count, created_at)
               VALUES (?1, ?2, ?3, 0, 0, 0, ?4)"#,
            params![
                &post.id,
                &post.content,
                &post.author,
                format_datetime(&post.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_post(&self, id: &str) -> StoreResult<Post> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM posts WHERE id = ?1", params![id], |row| {
            self.row_to_post(row)
        })
        .map_err(|e| not_found_or(e, format!("Post {}", id)))
    }

    /// Posts newest first
    pub fn list_posts(&self, limit: i64, offset: i64) -> StoreResult<Vec<Post>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM posts ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"#,
        )?;
        let rows = stmt.query_map(params![limit, offset], |row| self.row_to_post(row))?;

        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        Ok(posts)
    }

    pub fn count_posts(&self) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete a post and its comments, returning how many comments went with it
    pub fn delete_post(&self, id: &str) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM comments WHERE post_id = ?1", params![id])?;
        let rows = tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Post {}", id)));
        }

        tx.commit()?;
        Ok(removed)
    }

    /// Move a reaction counter by `delta` in place, floored at zero
    pub fn adjust_reaction(&self, id: &str, reaction: Reaction, delta: i64) -> StoreResult<Post> {
        let conn = self.conn()?;
        let column = reaction.column();
        let sql = format!(
            "UPDATE posts SET {col} = MAX({col} + ?1, 0) WHERE id = ?2",
            col = column
        );

        let rows = conn.execute(&sql, params![delta, id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Post {}", id)));
        }

        conn.query_row("SELECT * FROM posts WHERE id = ?1", params![id], |row| {
            self.row_to_post(row)
        })
        .map_err(|e| not_found_or(e, format!("Post {}", id)))
    }

    fn row_to_post(&self, row: &rusqlite::Row) -> rusqlite::Result<Post> {
        Ok(Post {
            id: row.get("id")?,
            content: row.get("content")?,
            author: row.get("author")?,
            likes: row.get("likes")?,
            dislikes: row.get("dislikes")?,
            comment_count: row.get("comment_count")?,
            created_at: parse_datetime(row.get::<_, String>("created_at")?),
        })
    }

    // ==================== Comment Operations ====================

    /// Insert a comment and bump its post's counter in one transaction
    pub fn create_comment(&self, comment: &mut Comment) -> StoreResult<()> {
        let mut conn = self.conn()?;
        comment.id = Uuid::new_v4().to_string();
        comment.created_at = Utc::now();

        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE posts SET comment_count = comment_count + 1 WHERE id = ?1",
            params![&comment.post_id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Post {}", comment.post_id)));
        }

        tx.execute(
            r#"INSERT INTO comments (id, post_id, content, author, author_id, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                &comment.id,
                &comment.post_id,
                &comment.content,
                &comment.author,
                &comment.author_id,
                format_datetime(&comment.created_at),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_comment(&self, id: &str) -> StoreResult<Comment> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM comments WHERE id = ?1", params![id], |row| {
            self.row_to_comment(row)
        })
        .map_err(|e| not_found_or(e, format!("Comment {}", id)))
    }

    /// Comments on one post, oldest first
    pub fn list_comments(&self, post_id: &str) -> StoreResult<Vec<Comment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM comments WHERE post_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![post_id], |row| self.row_to_comment(row))?;

        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }

    /// Comments on the given posts, oldest first
    pub fn list_comments_for_posts(&self, post_ids: &[String]) -> StoreResult<Vec<Comment>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let placeholders = vec!["?"; post_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM comments WHERE post_id IN ({}) ORDER BY created_at ASC, rowid ASC",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(post_ids.iter()), |row| {
            self.row_to_comment(row)
        })?;

        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }

    /// Remove a comment from a post and drop the post's counter in one transaction
    pub fn delete_comment(&self, post_id: &str, comment_id: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "DELETE FROM comments WHERE id = ?1 AND post_id = ?2",
            params![comment_id, post_id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Comment {}", comment_id)));
        }

        tx.execute(
            "UPDATE posts SET comment_count = MAX(comment_count - 1, 0) WHERE id = ?1",
            params![post_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn row_to_comment(&self, row: &rusqlite::Row) -> rusqlite::Result<Comment> {
        Ok(Comment {
            id: row.get("id")?,
            post_id: row.get("post_id")?,
            content: row.get("content")?,
            author: row.get("author")?,
            author_id: row.get("author_id")?,
            created_at: parse_datetime(row.get::<_, String>("created_at")?),
        })
    }

    // ==================== Image Operations ====================

    pub fn create_image(&self, image: &mut ImageRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        image.id = Uuid::new_v4().to_string();
        image.uploaded_at = Utc::now();

        conn.execute(
            r#"INSERT INTO images (id, kind, data, image_url, content_type, file_name, size, uploaded_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                &image.id,
                image.kind.as_str(),
                &image.data,
                &image.image_url,
                &image.content_type,
                &image.file_name,
                image.size,
                format_datetime(&image.uploaded_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_image(&self, id: &str) -> StoreResult<ImageRecord> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM images WHERE id = ?1", params![id], |row| {
            self.row_to_image(row)
        })
        .map_err(|e| not_found_or(e, format!("Image {}", id)))
    }

    /// Images newest first, optionally of one kind
    pub fn list_images(&self, kind: Option<ImageKind>) -> StoreResult<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut images = Vec::new();

        if let Some(k) = kind {
            let mut stmt = conn.prepare(
                "SELECT * FROM images WHERE kind = ?1 ORDER BY uploaded_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![k.as_str()], |row| self.row_to_image(row))?;
            for row in rows {
                images.push(row?);
            }
        } else {
            let mut stmt =
                conn.prepare("SELECT * FROM images ORDER BY uploaded_at DESC, rowid DESC")?;
            let rows = stmt.query_map([], |row| self.row_to_image(row))?;
            for row in rows {
                images.push(row?);
            }
        }

        Ok(images)
    }

    /// The most recent upload of a kind
    pub fn current_image(&self, kind: ImageKind) -> StoreResult<Option<ImageRecord>> {
        let conn = self.conn()?;
        let image = conn
            .query_row(
                "SELECT * FROM images WHERE kind = ?1 ORDER BY uploaded_at DESC, rowid DESC LIMIT 1",
                params![kind.as_str()],
                |row| self.row_to_image(row),
            )
            .optional()?;
        Ok(image)
    }

    pub fn delete_image(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Image {}", id)));
        }
        Ok(())
    }

    fn row_to_image(&self, row: &rusqlite::Row) -> rusqlite::Result<ImageRecord> {
        let kind: String = row.get("kind")?;
        let data: Option<Vec<u8>> = row.get("data")?;

        Ok(ImageRecord {
            id: row.get("id")?,
            kind: ImageKind::parse(&kind).unwrap_or(ImageKind::Profile),
            data: data.unwrap_or_default(),
            image_url: row.get("image_url")?,
            content_type: row.get("content_type")?,
            file_name: row.get("file_name")?,
            size: row.get("size")?,
            uploaded_at: parse_datetime(row.get::<_, String>("uploaded_at")?),
        })
    }
}

fn not_found_or(e: rusqlite::Error, what: String) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what),
        _ => StoreError::Database(e),
    }
}

// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
