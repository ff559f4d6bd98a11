//! Integration tests for the scrape proxy.
//!
//! These tests run the real HTTP server with the probe exporter against
//! local TCP listeners standing in for database targets.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use multitude::{Dispatcher, HttpServer, ProbeExporterFactory, ProxyConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running proxy and the handles needed to inspect and stop it.
struct TestProxy {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher<ProbeExporterFactory>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestProxy {
    async fn start() -> Self {
        let config = ProxyConfig::parse(
            r#"{
                credentials: { username: "monitor", password: "secret" },
                web: { listen: "127.0.0.1:0" },
                mongodb: { connect_timeout_ms: 500 },
            }"#,
        )
        .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(ProbeExporterFactory, config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = HttpServer::new(dispatcher.clone(), addr);
        let task = tokio::spawn(server.serve(listener, shutdown_rx));

        Self {
            addr,
            dispatcher,
            shutdown,
            task,
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }
}

/// A listener that accepts TCP connections like a database would.
async fn fake_database() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn test_first_and_repeated_scrape() {
    let (_db, db_addr) = fake_database().await;
    let proxy = TestProxy::start().await;
    let client = reqwest::Client::new();

    let response = client
        .get(proxy.url(&format!("/metrics?target={}", db_addr)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("mongodb_up 1"), "body: {}", body);
    assert!(body.contains("mongodb_scrapes_total 1"));
    assert_eq!(proxy.dispatcher.cache().count(), 1);

    let response = client
        .get(proxy.url(&format!("/metrics?target={}", db_addr)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    // Same exporter instance: its scrape counter keeps going.
    assert!(body.contains("mongodb_scrapes_total 2"), "body: {}", body);

    let stats = proxy.dispatcher.cache().stats();
    assert_eq!(proxy.dispatcher.cache().count(), 1);
    assert_eq!(stats.constructions, 1);
    assert_eq!(stats.hits, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_malformed_scrape_echoes_query() {
    let proxy = TestProxy::start().await;

    let response = reqwest::get(proxy.url("/metrics?host=db%2001&mode=a+b"))
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("malformed scrape request: missing required query parameter 'target'"));
    assert!(body.ends_with("host=db 01&mode=a b"), "body: {}", body);
    assert_eq!(proxy.dispatcher.cache().count(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_target_is_not_cached() {
    let proxy = TestProxy::start().await;

    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    for _ in 0..2 {
        let response = reqwest::get(proxy.url(&format!("/metrics?target=127.0.0.1:{}", dead_port)))
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        let body = response.text().await.unwrap();
        assert!(body.contains("failed to construct exporter for 127.0.0.1:"));
    }

    let stats = proxy.dispatcher.cache().stats();
    assert_eq!(proxy.dispatcher.cache().count(), 0);
    assert_eq!(stats.construction_failures, 2);

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_scrapes_share_one_exporter() {
    let (_db, db_addr) = fake_database().await;
    let proxy = TestProxy::start().await;
    let client = reqwest::Client::new();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let client = client.clone();
        let url = proxy.url(&format!("/metrics?target={}", db_addr));
        handles.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }

    let stats = proxy.dispatcher.cache().stats();
    assert_eq!(proxy.dispatcher.cache().count(), 1);
    assert_eq!(stats.constructions, 1);
    assert_eq!(stats.hits, 19);

    proxy.stop().await;
}

#[tokio::test]
async fn test_equivalent_targets_share_exporter() {
    let (_db1, db1) = fake_database().await;
    let (_db2, db2) = fake_database().await;
    let proxy = TestProxy::start().await;

    for query in [
        format!("target={},{}", db1, db2),
        format!("target={},{}", db2, db1),
        format!("address={},{},{}", db1, db2, db1),
    ] {
        let response = reqwest::get(proxy.url(&format!("/metrics?{}", query)))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(proxy.dispatcher.cache().count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_targets_endpoint_reports_cache() {
    let (_db, db_addr) = fake_database().await;
    let proxy = TestProxy::start().await;

    reqwest::get(proxy.url(&format!("/metrics?target={}", db_addr)))
        .await
        .unwrap();

    let report: serde_json::Value = reqwest::get(proxy.url("/targets"))
        .await
        .unwrap()
        .text()
        .await
        .map(|body| serde_json::from_str(&body).unwrap())
        .unwrap();

    assert_eq!(report["count"], 1);
    assert_eq!(report["targets"][0]["target"], db_addr.to_string());
    assert!(report["targets"][0]["created_at"].is_string());

    let health = reqwest::get(proxy.url("/health")).await.unwrap();
    assert_eq!(health.status(), 200);

    proxy.stop().await;
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
            credentials: {{ username: "monitor", password: "p@ss" }},
            web: {{ listen: "127.0.0.1:9216", telemetry_path: "/scrape" }},
            eviction: {{ idle_timeout_secs: 300 }},
        }}"#
    )
    .unwrap();

    let config = ProxyConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.web.telemetry_path, "/scrape");
    assert_eq!(config.credentials.password, "p@ss");
    assert!(!config.eviction.policy().is_noop());
}
