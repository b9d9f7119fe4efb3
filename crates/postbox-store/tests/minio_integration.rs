//! Exercises the S3 backend against a live MinIO instance.
//!
//! Skipped unless `POSTBOX_TEST_S3_ENDPOINT` is set, e.g.
//! `POSTBOX_TEST_S3_ENDPOINT=http://127.0.0.1:9000 cargo test -p postbox-store`.

use std::{env, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use postbox_store::{
    Database, NewFile, NewPost, NewUser, ObjectStore, PageRequest, PostFilter, S3Config, S3Store,
};
use uuid::Uuid;

fn live_config() -> Option<S3Config> {
    let endpoint = env::var("POSTBOX_TEST_S3_ENDPOINT").ok()?;
    Some(S3Config {
        endpoint: Some(endpoint),
        bucket: env::var("POSTBOX_TEST_S3_BUCKET").unwrap_or_else(|_| "postbox-test".into()),
        region: None,
        // Unique prefix per run keeps runs independent inside a shared bucket.
        prefix: Some(format!("it-{}", Uuid::new_v4())),
        access_key_id: Some(
            env::var("POSTBOX_TEST_S3_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into()),
        ),
        secret_access_key: Some(
            env::var("POSTBOX_TEST_S3_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into()),
        ),
        force_path_style: true,
    })
}

#[tokio::test]
async fn records_roundtrip_through_minio() -> Result<()> {
    let Some(config) = live_config() else {
        eprintln!("POSTBOX_TEST_S3_ENDPOINT not set; skipping MinIO integration test");
        return Ok(());
    };

    let store = S3Store::new(config)?;
    store.ensure_bucket().await?;
    store.health_check().await?;
    let store = Arc::new(store);
    let db = Database::new(store.clone());

    let user = db
        .insert_user(NewUser {
            username: "minio-user",
            email: "minio@example.com",
            password_hash: "$2b$04$hash",
        })
        .await?;
    assert_eq!(
        db.find_user_by_email("MINIO@example.com").await?.map(|u| u.id),
        Some(user.id)
    );

    let post = db
        .insert_post(NewPost {
            author_id: user.id,
            title: "stored in a bucket",
            content: "hello",
        })
        .await?;
    let page = db
        .list_posts(
            PostFilter {
                author_id: Some(user.id),
            },
            PageRequest::default(),
        )
        .await?;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, post.id);

    let file = db
        .insert_file(
            NewFile {
                owner_id: user.id,
                filename: "hello.txt",
                content_type: "text/plain",
                sha256: "unused",
            },
            Bytes::from_static(b"hello from minio"),
        )
        .await?;
    let content = db.read_file_content(&file).await?.expect("file contents");
    assert_eq!(content.bytes, Bytes::from_static(b"hello from minio"));
    assert_eq!(content.content_type.as_deref(), Some("text/plain"));

    assert!(db.delete_file(file.id).await?);
    assert!(!store.delete(&file.object_key).await?);
    assert!(db.delete_post(post.id).await?);
    assert!(db.delete_user(user.id).await?);
    assert!(store.list("").await?.is_empty());
    Ok(())
}
