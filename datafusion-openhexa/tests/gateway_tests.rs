//! End-to-end tests: SQL through the gateway against a mocked OpenHexa endpoint

use datafusion::arrow::array::{Array, RecordBatch, StringArray};
use datafusion_openhexa::{CallerIdentity, ConnectionGateway, Error, OpenHexaConfig};
use openhexa_client::ClientConfig;
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server: &MockServer) -> OpenHexaConfig {
    let mut config = OpenHexaConfig::default();
    config.client = ClientConfig {
        url: format!("{}/graphql/", server.uri()),
        api_token: Some("test-token".to_string()),
        timeout_ms: 5_000,
        max_retries: 2,
        backoff_ms: 10,
        page_size: 100,
    };
    config
}

fn datasets_response() -> serde_json::Value {
    let dataset = |workspace: &str, slug: &str, files: serde_json::Value| {
        json!({
            "slug": slug,
            "workspace": {"slug": workspace},
            "versions": {"items": [{"name": "v1", "files": {"items": files}}]}
        })
    };
    json!({
        "data": {
            "datasets": {
                "totalPages": 1,
                "items": [
                    dataset("ws1", "population", json!([
                        {"id": "file-42", "filename": "pop.parquet"},
                        {"id": "file-43", "filename": "pop_2024.parquet"}
                    ])),
                    dataset("ws2", "rainfall", json!([
                        {"id": "file-77", "filename": "rain.csv"}
                    ])),
                ]
            }
        }
    })
}

fn url_response(url: Option<&str>) -> serde_json::Value {
    match url {
        Some(url) => json!({"data": {"datasetVersionFile": {"downloadUrl": url}}}),
        None => json!({"data": {"datasetVersionFile": null}}),
    }
}

async fn mount_listing(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/graphql/"))
        .and(body_partial_json(json!({"variables": {"page": 1}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(datasets_response()))
        .mount(server)
        .await;
}

fn strings(batches: &[RecordBatch], column: usize) -> Vec<Option<String>> {
    batches
        .iter()
        .flat_map(|batch| {
            let array = batch
                .column(column)
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("string column");
            (0..array.len())
                .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listing_then_cached_url_resolution() {
    let mock_server = MockServer::start().await;
    mount_listing(&mock_server).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "file-42"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(url_response(Some("https://storage/signed/file-42")))
                .set_delay(Duration::from_millis(900)),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut config = test_config(&mock_server);
    config.cache.url_ttl_seconds = 2;
    let gateway = ConnectionGateway::from_config(config).expect("gateway");
    let alice = CallerIdentity::new("alice");

    let listing = gateway
        .handle(&alice, "SELECT * FROM list_files('ws1')")
        .await
        .expect("listing query");
    let schema = listing[0].schema();
    let columns: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(columns, vec!["workspace", "dataset", "version", "filename", "file_path"]);
    assert_eq!(strings(&listing, 4), vec![Some("file-42".into()), Some("file-43".into())]);

    let sql = "SELECT resolve_url('file-42')";

    let start = Instant::now();
    let first = gateway.handle(&alice, sql).await.expect("first resolution");
    let cold = start.elapsed();

    let start = Instant::now();
    let second = gateway.handle(&alice, sql).await.expect("second resolution");
    let warm = start.elapsed();

    println!("cold: {:?}, warm: {:?}", cold, warm);
    assert!(cold >= Duration::from_millis(900));
    assert!(warm < Duration::from_millis(300));
    assert_eq!(strings(&first, 0), strings(&second, 0));
    assert_eq!(strings(&first, 0), vec![Some("https://storage/signed/file-42".into())]);

    // past the URL TTL the upstream is asked again
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    gateway.handle(&alice, sql).await.expect("resolution after expiry");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonexistent_file_is_null() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "nonexistent-file"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(url_response(None)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = test_config(&mock_server);
    let gateway = ConnectionGateway::from_config(config).expect("gateway");

    let batches = gateway
        .handle(
            &CallerIdentity::anonymous(),
            "SELECT get_dataset_file_url('nonexistent-file') AS url",
        )
        .await
        .expect("query should not fail");

    assert_eq!(strings(&batches, 0), vec![None]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_urls_for_listed_files() {
    let mock_server = MockServer::start().await;
    mount_listing(&mock_server).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "file-42"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(url_response(Some("https://a"))))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "file-43"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [{"message": "denied", "extensions": {"code": "PERMISSION_DENIED"}}]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = ConnectionGateway::from_config(test_config(&mock_server)).expect("gateway");

    let batches = gateway
        .handle(
            &CallerIdentity::new("alice"),
            "SELECT filename, resolve_url(file_path) AS url \
             FROM openhexa_dataset_files('ws1') ORDER BY filename",
        )
        .await
        .expect("query");

    assert_eq!(
        strings(&batches, 0),
        vec![Some("pop.parquet".into()), Some("pop_2024.parquet".into())]
    );
    assert_eq!(strings(&batches, 1), vec![Some("https://a".into()), None]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identities_list_concurrently() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"page": 1}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(datasets_response())
                .set_delay(Duration::from_millis(200)),
        )
        // one load per workspace filter
        .expect(2)
        .mount(&mock_server)
        .await;

    let gateway = ConnectionGateway::from_config(test_config(&mock_server)).expect("gateway");
    let alice = CallerIdentity::new("alice");
    let bob = CallerIdentity::new("bob");

    let (alice_rows, bob_rows) = tokio::join!(
        gateway.handle(&alice, "SELECT file_path FROM list_files('ws1') ORDER BY file_path"),
        gateway.handle(&bob, "SELECT file_path FROM list_files('ws2')"),
    );

    assert_eq!(
        strings(&alice_rows.expect("alice"), 0),
        vec![Some("file-42".into()), Some("file-43".into())]
    );
    assert_eq!(strings(&bob_rows.expect("bob"), 0), vec![Some("file-77".into())]);

    let alice_session = gateway.registry().get_or_create(&alice).await.expect("alice session");
    let bob_session = gateway.registry().get_or_create(&bob).await.expect("bob session");
    assert_ne!(alice_session.id(), bob_session.id());
    assert_eq!(gateway.registry().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution_single_flight() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "file-42"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(url_response(Some("https://storage/signed/file-42")))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = ConnectionGateway::from_config(test_config(&mock_server)).expect("gateway");

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                let identity = CallerIdentity::new(format!("user-{}", i % 3));
                gateway
                    .handle(&identity, "SELECT resolve_url('file-42')")
                    .await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        let batches = task.expect("task").expect("query");
        assert_eq!(
            strings(&batches, 0),
            vec![Some("https://storage/signed/file-42".into())]
        );
    }

    let stats = gateway.cache().urls().stats();
    assert_eq!(stats.loads, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_failure_is_not_cached() {
    let mock_server = MockServer::start().await;

    // exhausts the client's retries (1 attempt + 2 retries)
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "file-42"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(url_response(Some("https://ok"))))
        .expect(1)
        .mount(&mock_server)
        .await;

    let gateway = ConnectionGateway::from_config(test_config(&mock_server)).expect("gateway");
    let alice = CallerIdentity::new("alice");
    let sql = "SELECT resolve_url('file-42')";

    let err = gateway.handle(&alice, sql).await.unwrap_err();
    assert!(matches!(err, Error::DataFusion(_)), "unexpected error: {}", err);
    let fingerprint = datafusion_openhexa::MetadataCache::url_fingerprint("file-42");
    assert!(!gateway.cache().urls().contains(&fingerprint));

    let batches = gateway.handle(&alice, sql).await.expect("retry after failure");
    assert_eq!(strings(&batches, 0), vec![Some("https://ok".into())]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transport_failure_as_null_when_configured() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let mut config = test_config(&mock_server);
    config.functions.null_on_transport_error = true;
    let gateway = ConnectionGateway::from_config(config).expect("gateway");

    let batches = gateway
        .handle(&CallerIdentity::new("alice"), "SELECT resolve_url('file-42')")
        .await
        .expect("query should degrade to NULL");
    assert_eq!(strings(&batches, 0), vec![None]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_timeout_bounds_slow_url_resolution() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"variables": {"fileId": "file-42"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(url_response(Some("https://storage/signed/file-42")))
                .set_delay(Duration::from_millis(2_000)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut config = test_config(&mock_server);
    config.gateway.request_timeout_ms = Some(100);
    let gateway = ConnectionGateway::from_config(config).expect("gateway");

    let start = Instant::now();
    let err = gateway
        .handle(&CallerIdentity::new("alice"), "SELECT resolve_url('file-42')")
        .await
        .unwrap_err();
    let took = start.elapsed();

    assert!(matches!(err, Error::Timeout(_)), "unexpected error: {}", err);
    assert!(took < Duration::from_millis(1_000), "deadline missed: {:?}", took);

    // the abandoned lookup completes in the background
    tokio::time::sleep(Duration::from_millis(2_300)).await;
    let fingerprint = datafusion_openhexa::MetadataCache::url_fingerprint("file-42");
    assert!(gateway.cache().urls().contains(&fingerprint));
}
