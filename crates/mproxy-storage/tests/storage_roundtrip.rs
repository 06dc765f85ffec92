use mproxy_storage::{SqlStorage, StorageError};

use sea_orm::EntityTrait;

/// Fresh sqlite database per test, keyed by test name so the shared
/// connection cache never crosses tests.
async fn storage(tag: &str, master: &str) -> (SqlStorage, std::path::PathBuf) {
    let path = std::env::temp_dir().join(format!(
        "mproxy-storage-{tag}-{}.db",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let storage = SqlStorage::connect(&dsn, master).await.unwrap();
    storage.sync().await.unwrap();
    (storage, path)
}

#[tokio::test]
async fn inserted_secret_round_trips_through_encryption() {
    let (storage, path) = storage("roundtrip", "integration-master-secret").await;

    let id = storage
        .insert_api_key("openai", "sk-live-roundtrip-4242", None, None)
        .await
        .unwrap();

    // The stored column is ciphertext, not the plaintext key.
    let row = mproxy_storage::entities::ApiKeys::find_by_id(id)
        .one(storage.connection())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(row.secret_ciphertext, "sk-live-roundtrip-4242");
    assert!(!row.secret_ciphertext.contains("roundtrip"));

    let keys = storage.load_api_keys().await.unwrap();
    let key = keys.iter().find(|key| key.id == id).unwrap();
    assert_eq!(key.secret, "sk-live-roundtrip-4242");
    assert_eq!(key.provider, "openai");
    assert_eq!(key.auth_header, "Authorization");
    assert_eq!(key.auth_format, "Bearer {key}");
    assert!(key.enabled);
    assert_eq!(key.requests_count, 0);

    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn auth_overrides_survive_the_round_trip() {
    let (storage, path) = storage("overrides", "integration-master-secret").await;

    let id = storage
        .insert_api_key(
            "anthropic",
            "sk-ant-live-12345678",
            Some("x-api-key"),
            Some("{key}"),
        )
        .await
        .unwrap();

    let keys = storage.load_api_keys().await.unwrap();
    let key = keys.iter().find(|key| key.id == id).unwrap();
    assert_eq!(key.auth_header, "x-api-key");
    assert_eq!(key.auth_format, "{key}");

    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn weak_or_placeholder_keys_are_refused() {
    let (storage, path) = storage("weak", "integration-master-secret").await;

    for secret in ["short", "sk-test-12345678", "your-key-goes-here"] {
        let err = storage
            .insert_api_key("openai", secret, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::WeakKey(_)), "{secret}");
    }
    assert!(storage.load_api_keys().await.unwrap().is_empty());

    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn wrong_master_key_skips_rows_instead_of_failing() {
    let (storage, path) = storage("wrong-master", "first-master-secret").await;
    storage
        .insert_api_key("gemini", "AIza-live-987654321", None, None)
        .await
        .unwrap();

    // Same database, different master secret: the row no longer decrypts
    // and must be skipped, not turned into a load error.
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let other = SqlStorage::connect(&dsn, "second-master-secret").await.unwrap();
    assert!(other.load_api_keys().await.unwrap().is_empty());

    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn persisted_stats_come_back_on_reload() {
    let (storage, path) = storage("stats", "integration-master-secret").await;
    let id = storage
        .insert_api_key("deepseek", "sk-live-stats-24680", None, None)
        .await
        .unwrap();

    let mut key = storage
        .load_api_keys()
        .await
        .unwrap()
        .into_iter()
        .find(|key| key.id == id)
        .unwrap();
    key.requests_count = 12;
    key.success_count = 10;
    key.error_count = 2;
    key.consecutive_errors = 1;
    key.total_tokens = 900;
    key.input_tokens = 600;
    key.output_tokens = 300;
    key.avg_latency = 0.75;
    key.cost = 0.0123;
    key.last_error = Some("upstream error (500): boom".to_string());
    key.flagged_for_rotation = true;
    storage.persist_key_stats(&key).await.unwrap();

    let reloaded = storage
        .load_api_keys()
        .await
        .unwrap()
        .into_iter()
        .find(|key| key.id == id)
        .unwrap();
    assert_eq!(reloaded.requests_count, 12);
    assert_eq!(reloaded.success_count, 10);
    assert_eq!(reloaded.error_count, 2);
    assert_eq!(reloaded.consecutive_errors, 1);
    assert_eq!(reloaded.total_tokens, 900);
    assert_eq!(reloaded.avg_latency, 0.75);
    assert_eq!(reloaded.cost, 0.0123);
    assert_eq!(
        reloaded.last_error.as_deref(),
        Some("upstream error (500): boom")
    );
    assert!(reloaded.flagged_for_rotation);
    // The secret is untouched by a stats writeback.
    assert_eq!(reloaded.secret, "sk-live-stats-24680");

    std::fs::remove_file(path).ok();
}
