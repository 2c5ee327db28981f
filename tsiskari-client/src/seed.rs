use serde_json::{Value, json};
use shared::{Error, Result};
use storage_engine::MemoryBackend;
use tsiskari::domain::{ConflictTarget, Row};
use tsiskari::planes::control::privileged::DEACTIVATE_ACCOUNT;
use tsiskari::ports::Backend;

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// Tables, a few rows and the account functions of a small social app.
pub async fn seed(backend: &MemoryBackend, user_id: &str) -> Result<()> {
    backend
        .define_table("profiles", [ConflictTarget::new(["id"])])
        .await;
    backend
        .define_table("post_likes", [ConflictTarget::new(["post_id", "user_id"])])
        .await;
    backend
        .define_table("story_views", [ConflictTarget::new(["story_id", "viewer_id"])])
        .await;

    backend
        .insert(
            "profiles",
            row(json!({ "id": user_id, "username": "nino", "approval_status": "approved" })),
        )
        .await?;

    for (id, title) in [(1, "ზღვა ბათუმში"), (2, "ხინკალი"), (3, "თბილისის ღამე")] {
        backend
            .insert("posts", row(json!({ "id": id, "author_id": "giorgi", "title": title })))
            .await?;
    }

    backend.register_function(DEACTIVATE_ACCOUNT, true, |_, caller| {
        let user = caller.ok_or_else(|| Error::Auth("no caller".into()))?;
        Ok(json!({ "deactivated": user }))
    });

    Ok(())
}
