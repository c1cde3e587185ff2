use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{Comment, CommentView, FeedItem, Post};

/// Group comments under their posts.
/// Posts keep the order they are given in; comments keep theirs within a post.
pub fn assemble_feed(posts: Vec<Post>, comments: Vec<Comment>, now: DateTime<Utc>) -> Vec<FeedItem> {
    let mut by_post: HashMap<String, Vec<CommentView>> = HashMap::new();
    for comment in comments {
        let view = CommentView {
            relative_time: relative_time(comment.created_at, now),
            comment,
        };
        by_post.entry(view.comment.post_id.clone()).or_default().push(view);
    }

    posts
        .into_iter()
        .map(|post| {
            let comments = by_post.remove(&post.id).unwrap_or_default();
            FeedItem {
                exact_time: exact_time(post.created_at),
                relative_time: relative_time(post.created_at, now),
                comments,
                post,
            }
        })
        .collect()
}

/// "N minutes ago" for the first hour, "N hours ago" for the first day, then days
pub fn relative_time(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - ts).num_minutes().max(0);

    if minutes < 60 {
        plural(minutes, "minute")
    } else if minutes < 1440 {
        plural(minutes / 60, "hour")
    } else {
        plural(minutes / 1440, "day")
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

/// `DD/MM/YYYY HH:MM`
pub fn exact_time(ts: DateTime<Utc>) -> String {
    ts.format("%d/%m/%Y %H:%M").to_string()
}
