use crate::model::{Fields, RecordId};
use crate::store::MemoryStore;
use anyhow::{Context, Result};
use serde_json::json;

fn record(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Loads a small blog: posts with tags (post_tag pivot) and comments (post_id).
///
/// Matches the default relationship configuration. Tag names are unique.
pub fn load_demo_data(store: &MemoryStore) -> Result<()> {
    store.add_unique("tags", "name");

    let hello = store
        .insert("posts", record(json!({"title": "Hello world"})))
        .context("Failed to insert demo post")?;
    let second = store
        .insert("posts", record(json!({"title": "Second post"})))
        .context("Failed to insert demo post")?;

    let mut tag_ids: Vec<RecordId> = Vec::new();
    for name in ["rust", "async", "web"] {
        let id = store
            .insert("tags", record(json!({ "name": name })))
            .with_context(|| format!("Failed to insert demo tag '{}'", name))?;
        tag_ids.push(id);
    }

    store.attach("post_tag", "post_id", hello, "tag_id", tag_ids[0]);
    store.attach("post_tag", "post_id", hello, "tag_id", tag_ids[1]);
    store.attach("post_tag", "post_id", second, "tag_id", tag_ids[2]);

    let comments = [
        (hello, "First!"),
        (hello, "Nice write-up"),
        (second, "Looking forward to part two"),
    ];
    for (post_id, body) in comments {
        store
            .insert(
                "comments",
                record(json!({"post_id": post_id, "body": body, "status": "published"})),
            )
            .context("Failed to insert demo comment")?;
    }

    log::info!(
        "Loaded demo data: 2 posts, {} tags, {} comments",
        tag_ids.len(),
        comments.len()
    );
    Ok(())
}
