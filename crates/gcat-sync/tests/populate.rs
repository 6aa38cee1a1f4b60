use std::sync::Arc;

use gcat_core::EntityKind;
use gcat_storage::{ContentStore, InMemoryContentStore};
use gcat_sync::{PopulateParams, PopulatePipeline, ProductOutcome, SyncConfig, SUMMARY_FILE};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DETAIL_HTML: &str = r##"<html><body>
<div class="description"><p>Race across <b>sunset</b> highways.</p></div>
<svg class="age-restrictions__icon"><use xlink:href="#_PEGI_3"></use></svg>
</body></html>"##;

fn config(server: &MockServer) -> SyncConfig {
    SyncConfig {
        catalog_url: format!("{}/v1/catalog", server.uri()),
        detail_url: server.uri(),
        app_url: server.uri(),
        http_timeout_secs: 5,
        store_timeout_secs: 5,
        max_retries: 0,
        ..Default::default()
    }
}

fn sample_game(server: &MockServer) -> Value {
    json!({
        "title": "Sample Game",
        "slug": "sample-game",
        "price": null,
        "releaseDate": "2024-01-01",
        "genres": [{"name": "Action"}],
        "operatingSystems": ["windows"],
        "developers": ["Studio A"],
        "publishers": ["Pub B"],
        "coverHorizontal": format!("{}/img/sample-cover.jpg", server.uri()),
        "screenshots": []
    })
}

async fn mount_catalog(server: &MockServer, products: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/v1/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "products": products })))
        .mount(server)
        .await;
}

async fn mount_images_and_upload(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/(img|shots)/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF, 0xE0]))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/upload/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(server)
        .await;
}

async fn mount_detail(server: &MockServer, slug: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/game/{slug}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL_HTML))
        .mount(server)
        .await;
}

fn pipeline(server: &MockServer, store: Arc<InMemoryContentStore>) -> PopulatePipeline {
    let store: Arc<dyn ContentStore> = store;
    PopulatePipeline::new(config(server), store).unwrap()
}

async fn upload_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == "/api/upload/")
        .count()
}

#[tokio::test]
async fn sample_game_populates_entities_entry_and_cover() {
    let server = MockServer::start().await;
    mount_catalog(&server, vec![sample_game(&server)]).await;
    mount_detail(&server, "sample_game").await;
    mount_images_and_upload(&server).await;

    let store = Arc::new(InMemoryContentStore::new());
    let summary = pipeline(&server, store.clone())
        .populate(&PopulateParams::default())
        .await
        .unwrap();

    assert_eq!(summary.fetched_products, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.uploads_ok, 1);
    assert!(!summary.is_degraded());

    for (kind, name, slug) in [
        (EntityKind::Developer, "Studio A", "studio-a"),
        (EntityKind::Publisher, "Pub B", "pub-b"),
        (EntityKind::Category, "Action", "action"),
        (EntityKind::Platform, "windows", "windows"),
    ] {
        let records = store.records(kind).await;
        assert_eq!(records.len(), 1, "{kind}");
        assert_eq!(records[0].name, name);
        assert_eq!(records[0].slug, slug);
    }

    let games = store.records(EntityKind::Game).await;
    assert_eq!(games.len(), 1);
    let entry = &games[0].attributes;
    assert_eq!(entry["name"], "Sample Game");
    assert_eq!(entry["slug"], "sample-game");
    assert_eq!(entry["price"], "0.00");
    assert_eq!(entry["release_date"], "2024-01-01");
    assert_eq!(entry["rating"], "PEGI3");
    assert_eq!(entry["short_description"], "Race across sunset highways.");
    assert!(entry["publishedAt"].is_string());

    let developer_id = store.records(EntityKind::Developer).await[0].id;
    assert_eq!(entry["developers"], json!([developer_id]));

    assert_eq!(upload_count(&server).await, 1);
}

#[tokio::test]
async fn detail_page_failure_still_creates_the_entry() {
    let server = MockServer::start().await;
    mount_catalog(&server, vec![sample_game(&server)]).await;
    mount_images_and_upload(&server).await;
    Mock::given(method("GET"))
        .and(path("/game/sample_game"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryContentStore::new());
    let summary = pipeline(&server, store.clone())
        .populate(&PopulateParams::default())
        .await
        .unwrap();

    match &summary.outcomes[0] {
        ProductOutcome::Created { enriched, .. } => assert!(!enriched),
        other => panic!("unexpected outcome {other:?}"),
    }
    let entry = &store.records(EntityKind::Game).await[0].attributes;
    assert!(entry.get("description").is_none());
    assert!(entry.get("short_description").is_none());
    assert!(entry.get("rating").is_none());
}

#[tokio::test]
async fn second_run_creates_nothing_new() {
    let server = MockServer::start().await;
    let mut other = sample_game(&server);
    other["title"] = json!("Sample Game II");
    other["slug"] = json!("sample-game-ii");
    other["developers"] = json!(["Studio A", "  Studio A  "]);
    mount_catalog(&server, vec![sample_game(&server), other]).await;
    mount_detail(&server, "sample_game").await;
    mount_detail(&server, "sample_game_ii").await;
    mount_images_and_upload(&server).await;

    let store = Arc::new(InMemoryContentStore::new());
    let pipeline = pipeline(&server, store.clone());

    let first = pipeline.populate(&PopulateParams::default()).await.unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(store.count(EntityKind::Developer).await, 1);

    let second = pipeline.populate(&PopulateParams::default()).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.entities.created(), 0);

    assert_eq!(store.count(EntityKind::Game).await, 2);
    for kind in EntityKind::RELATIONAL {
        assert_eq!(store.count(kind).await, 1, "{kind}");
    }
    assert_eq!(upload_count(&server).await, 2);
}

#[tokio::test]
async fn gallery_is_capped_at_five_screenshots() {
    let server = MockServer::start().await;
    let mut product = sample_game(&server);
    product["coverHorizontal"] = Value::Null;
    product["screenshots"] = json!((0..8)
        .map(|i| format!("{}/shots/{i}_{{formatter}}.jpg", server.uri()))
        .collect::<Vec<_>>());
    mount_catalog(&server, vec![product]).await;
    mount_detail(&server, "sample_game").await;
    mount_images_and_upload(&server).await;

    let summary = pipeline(&server, Arc::new(InMemoryContentStore::new()))
        .populate(&PopulateParams::default())
        .await
        .unwrap();

    assert_eq!(summary.uploads_ok, 5);
    assert_eq!(upload_count(&server).await, 5);
}

#[tokio::test]
async fn malformed_record_is_rejected_and_the_rest_ingested() {
    let server = MockServer::start().await;
    let broken = json!({"title": "Bundle without slug", "genres": [{"name": "Action"}]});
    mount_catalog(&server, vec![sample_game(&server), broken]).await;
    mount_detail(&server, "sample_game").await;
    mount_images_and_upload(&server).await;

    let store = Arc::new(InMemoryContentStore::new());
    let summary = pipeline(&server, store.clone())
        .populate(&PopulateParams::default())
        .await
        .unwrap();

    assert_eq!(summary.fetched_products, 2);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].index, 1);
    assert_eq!(summary.rejected[0].title.as_deref(), Some("Bundle without slug"));
    assert!(summary.is_degraded());
    assert_eq!(store.count(EntityKind::Game).await, 1);
}

#[tokio::test]
async fn catalog_failure_is_the_only_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryContentStore::new());
    let err = pipeline(&server, store.clone())
        .populate(&PopulateParams::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("catalog fetch failed"));
    assert_eq!(store.count(EntityKind::Game).await, 0);
}

#[tokio::test]
async fn params_reach_the_catalog_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog"))
        .and(query_param("limit", "2"))
        .and(query_param("productType", "in:game"))
        .and(query_param("releaseStatuses", "in:upcoming"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "products": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let params = PopulateParams {
        limit: Some(2),
        product_types: Some(vec!["game".into()]),
        release_statuses: Some("in:upcoming".into()),
        ..Default::default()
    };
    let summary = pipeline(&server, Arc::new(InMemoryContentStore::new()))
        .populate(&params)
        .await
        .unwrap();
    assert_eq!(summary.fetched_products, 0);
    assert!(summary.outcomes.is_empty());
}

#[tokio::test]
async fn failing_store_kind_is_reported_per_product() {
    let server = MockServer::start().await;
    mount_catalog(&server, vec![sample_game(&server)]).await;
    mount_detail(&server, "sample_game").await;
    mount_images_and_upload(&server).await;

    let store = Arc::new(InMemoryContentStore::new());
    store.fail_kind(EntityKind::Game).await;
    let summary = pipeline(&server, store.clone())
        .populate(&PopulateParams::default())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(summary.is_degraded());
    assert!(matches!(summary.outcomes[0], ProductOutcome::Failed { .. }));
    assert_eq!(store.count(EntityKind::Developer).await, 1);
    assert_eq!(upload_count(&server).await, 0);
}

#[tokio::test]
async fn report_is_written_under_the_run_id() {
    let server = MockServer::start().await;
    mount_catalog(&server, vec![sample_game(&server)]).await;
    mount_detail(&server, "sample_game").await;
    mount_images_and_upload(&server).await;

    let reports = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        reports_dir: Some(reports.path().to_path_buf()),
        ..config(&server)
    };
    let store: Arc<dyn ContentStore> = Arc::new(InMemoryContentStore::new());
    let summary = PopulatePipeline::new(config, store)
        .unwrap()
        .populate(&PopulateParams::default())
        .await
        .unwrap();

    let expected = reports
        .path()
        .join(summary.run_id.to_string())
        .join(SUMMARY_FILE);
    assert_eq!(summary.report_path.as_deref(), expected.to_str());

    let written: Value = serde_json::from_slice(&std::fs::read(&expected).unwrap()).unwrap();
    assert_eq!(written["created"], 1);
    assert_eq!(written["outcomes"][0]["status"], "created");
    assert_eq!(written["outcomes"][0]["title"], "Sample Game");
}
