use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use chrono::Utc;
use tempfile::TempDir;

use feed_harness::cache::EnrichmentCache;
use feed_harness::config::{Config, LedgerConfig};
use feed_harness::ledger::FailureLedger;
use feed_harness::models::{FailureCategory, NewItem};
use feed_harness::server::{router, AppState};
use feed_harness::store::ItemStore;
use feed_harness::{db, metrics, migrate};

fn fh_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fh"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/fh.sqlite"

[download]
concurrent_origins = 2
concurrent_items = 2

[server]
bind = "127.0.0.1:7341"
"#,
        root.display()
    );

    let config_path = config_dir.join("fh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_fh(config_path: &Path, args: &[&str]) -> Output {
    Command::new(fh_binary())
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("FH_DB_PATH")
        .env_remove("FH_ENRICH_HOST")
        .env_remove("FH_ENRICH_MODELS")
        .output()
        .expect("failed to execute fh")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let first = run_fh(&config_path, &["init"]);
    assert!(first.status.success(), "init failed: {}", stderr(&first));
    assert!(stdout(&first).contains("Database initialized"));

    let second = run_fh(&config_path, &["init"]);
    assert!(second.status.success(), "second init failed: {}", stderr(&second));
}

#[test]
fn test_stats_and_search_on_empty_store() {
    let (_tmp, config_path) = setup_test_env();
    run_fh(&config_path, &["init"]);

    let stats = run_fh(&config_path, &["stats"]);
    assert!(stats.status.success(), "stats failed: {}", stderr(&stats));
    assert!(stdout(&stats).contains("Items:       0"));

    let search = run_fh(&config_path, &["search", "rust"]);
    assert!(search.status.success(), "search failed: {}", stderr(&search));
    assert!(stdout(&search).contains("No results."));
}

#[test]
fn test_search_rejects_bad_flags() {
    let (_tmp, config_path) = setup_test_env();
    run_fh(&config_path, &["init"]);

    let bad_sort = run_fh(&config_path, &["search", "rust", "--sort", "random"]);
    assert!(!bad_sort.status.success());

    let bad_date = run_fh(&config_path, &["search", "rust", "--since", "yesterday"]);
    assert!(!bad_date.status.success());
    assert!(stderr(&bad_date).contains("invalid date"));
}

#[test]
fn test_health_exit_codes() {
    let (tmp, config_path) = setup_test_env();

    // Database file exists but has no schema.
    let before = run_fh(&config_path, &["health"]);
    assert_eq!(before.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&before.stdout).unwrap();
    assert_eq!(report["status"], "unhealthy");

    run_fh(&config_path, &["init"]);
    let after = run_fh(&config_path, &["health"]);
    assert!(after.status.success(), "health failed: {}", stderr(&after));
    let report: serde_json::Value = serde_json::from_slice(&after.stdout).unwrap();
    assert_eq!(report["status"], "degraded");
    assert_eq!(report["item_count"], 0);

    assert!(tmp.path().join("data/fh.sqlite").exists());
}

#[test]
fn test_get_and_delete_missing_item_fail() {
    let (_tmp, config_path) = setup_test_env();
    run_fh(&config_path, &["init"]);

    let get = run_fh(&config_path, &["get", "https://example.com/nope"]);
    assert!(!get.status.success());
    assert!(stderr(&get).contains("item not found"));

    let delete = run_fh(&config_path, &["delete", "https://example.com/nope"]);
    assert!(!delete.status.success());
}

#[test]
fn test_ingest_requires_origins() {
    let (_tmp, config_path) = setup_test_env();
    run_fh(&config_path, &["init"]);

    let output = run_fh(&config_path, &["ingest"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("No origins given"));

    let bad_origin = run_fh(&config_path, &["ingest", "--origin", "missing-equals"]);
    assert!(!bad_origin.status.success());
}

#[test]
fn test_enrich_requires_configuration() {
    let (_tmp, config_path) = setup_test_env();
    run_fh(&config_path, &["init"]);

    let output = run_fh(&config_path, &["enrich"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Enrichment is not configured"));
}

#[test]
fn test_failures_and_clean_cache_on_empty_store() {
    let (tmp, config_path) = setup_test_env();
    run_fh(&config_path, &["init"]);

    let report_path = tmp.path().join("failing.opml");
    let failures = run_fh(
        &config_path,
        &["failures", "--output", report_path.to_str().unwrap()],
    );
    assert!(failures.status.success(), "failures failed: {}", stderr(&failures));
    assert!(stdout(&failures).contains("No failures recorded."));
    let opml = fs::read_to_string(&report_path).unwrap();
    assert!(opml.contains("<opml version=\"2.0\">"));

    let clean = run_fh(&config_path, &["clean-cache", "--days", "7", "--dry-run"]);
    assert!(clean.status.success(), "clean-cache failed: {}", stderr(&clean));
    assert!(stdout(&clean).contains("would remove: 0"));
    assert!(stdout(&clean).contains("validators: 0 past 30 days"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        format!(
            "[db]\npath = \"{}/data/fh.sqlite\"\n\n[download]\nconcurrent_origins = 50\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let output = run_fh(&bad, &["init"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("concurrent_origins"));
}

// ============ HTTP API ============

async fn spawn_api() -> (TempDir, String, ItemStore, FailureLedger) {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("fh.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let store = ItemStore::new(pool.clone());
    let ledger = FailureLedger::new(pool, &LedgerConfig::default());
    let app = router(AppState::new(
        store.clone(),
        ledger.clone(),
        metrics::install().unwrap(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (tmp, base, store, ledger)
}

fn sample(url: &str, title: &str, body: &str) -> NewItem {
    NewItem {
        url: url.to_string(),
        title: title.to_string(),
        source_name: "Example".to_string(),
        origin_url: Some("https://example.com/feed.xml".to_string()),
        published: Some(Utc::now()),
        downloaded: Utc::now(),
        content_source: "page".to_string(),
        body: body.to_string(),
    }
}

#[tokio::test]
async fn test_api_search_items_and_errors() {
    let (_tmp, base, store, _ledger) = spawn_api().await;
    store
        .insert(&sample("https://example.com/a", "Async Rust", "tokio runtime internals"))
        .await
        .unwrap();
    store
        .insert(&sample("https://example.com/b", "Databases", "sqlite write ahead log"))
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["item_count"], 2);

    let page: serde_json::Value = client
        .get(format!("{}/search?q=tokio", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 1);
    assert_eq!(page["hits"][0]["item"]["title"], "Async Rust");

    let item = client
        .get(format!("{}/items", base))
        .query(&[("url", "https://example.com/b")])
        .send()
        .await
        .unwrap();
    assert_eq!(item.status(), reqwest::StatusCode::OK);
    let item: serde_json::Value = item.json().await.unwrap();
    assert_eq!(item["title"], "Databases");

    let missing = client
        .get(format!("{}/items", base))
        .query(&[("url", "https://example.com/none")])
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let bad_sort = client
        .get(format!("{}/search?q=x&sort=random", base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_sort.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = bad_sort.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_api_failure_report() {
    let (_tmp, base, _store, ledger) = spawn_api().await;
    ledger
        .record(
            FailureCategory::OriginFetch,
            "https://broken.example.com/rss",
            Some("Broken & Co"),
            "HTTP 404",
        )
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let list: serde_json::Value = client
        .get(format!("{}/failures?category=origin_fetch", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["retries"], 1);

    let opml = client
        .get(format!("{}/failures.opml", base))
        .send()
        .await
        .unwrap();
    assert_eq!(opml.status(), reqwest::StatusCode::OK);
    assert!(opml.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/x-opml"));
    let text = opml.text().await.unwrap();
    assert!(text.contains("xmlUrl=\"https://broken.example.com/rss\""));
    assert!(text.contains("Broken &amp; Co"));
}

#[tokio::test]
async fn test_api_metrics_exposition() {
    let (_tmp, base, store, _ledger) = spawn_api().await;
    let cache = EnrichmentCache::new(store.pool().clone(), 30);
    assert!(cache.get("no-such-key").await.unwrap().is_none());

    let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = response.text().await.unwrap();
    assert!(text.contains(metrics::CACHE_MISSES));
}
