//! Federation across several in-process nodes on loopback.

use localai_core::p2p::{NetworkToken, P2pNetwork, P2pOptions};
use localai_core::system::{GpuVendor, SystemState};
use localai_core::{generate_token, ApplicationConfig, CancellationToken, LocalAiApi};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn fast(token: &str) -> P2pOptions {
    P2pOptions::new(token)
        .with_gossip_listen("127.0.0.1:0")
        .with_gossip_interval(Duration::from_millis(50))
        .with_discovery_interval(Duration::from_millis(50))
}

fn seeded(token: &str, seed: std::net::SocketAddr) -> String {
    NetworkToken::decode(token)
        .unwrap()
        .with_peers(vec![seed.to_string()])
        .encode()
}

/// A worker that answers every connection with its own name.
async fn start_worker(name: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = socket.write_all(name.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr.to_string()
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_federated_requests_are_balanced_across_workers() {
    let cancel = CancellationToken::new();
    let token = generate_token();

    let proxy = P2pNetwork::start(
        &fast(&token)
            .with_node_name("proxy")
            .with_federated_listen("127.0.0.1:0")
            .with_load_balancing(true),
        None,
        None,
        &cancel,
    )
    .await
    .unwrap();
    let joined = seeded(&token, proxy.gossip_addr());

    let mut workers = Vec::new();
    for name in ["A", "B"] {
        let address = start_worker(name).await;
        workers.push(
            P2pNetwork::start(
                &fast(&joined)
                    .with_node_name(name)
                    .with_exposed_service("federated", address),
                None,
                None,
                &cancel,
            )
            .await
            .unwrap(),
        );
    }

    eventually("both workers online", || {
        proxy
            .nodes("federated")
            .iter()
            .filter(|n| n.online)
            .count()
            == 2
    })
    .await;

    let federated = proxy.federated_addr().unwrap();
    let mut served: HashMap<String, usize> = HashMap::new();
    for _ in 0..10 {
        let mut stream = TcpStream::connect(federated).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        *served.entry(reply).or_default() += 1;
    }

    assert_eq!(served.len(), 2, "{:?}", served);
    for name in ["A", "B"] {
        let count = served.get(name).copied().unwrap_or(0);
        assert!((4..=6).contains(&count), "{} served {}", name, count);
    }

    for worker in &workers {
        worker.stop().await;
    }
    proxy.stop().await;
}

struct SyncNode {
    _dir: TempDir,
    api: LocalAiApi,
}

async fn start_sync_node(token: &str, installed: &str) -> SyncNode {
    let dir = TempDir::new().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(
        models.join(format!("{}.yaml", installed)),
        format!("name: {}\nbackend: llama-cpp\n", installed),
    )
    .unwrap();

    let config = ApplicationConfig::new(&models, dir.path().join("backends"))
        .with_p2p(fast(token).with_sync(true, Duration::from_millis(100)));
    let system = SystemState::builder(&config.models_path, &config.backends_path)
        .gpu(GpuVendor::None, 0)
        .capability("default")
        .detect();
    let api = LocalAiApi::builder(config)
        .auto_create_dirs(true)
        .with_system_state(system)
        .build()
        .await
        .unwrap();
    SyncNode { _dir: dir, api }
}

fn has_operation_for(api: &LocalAiApi, element: &str) -> bool {
    api.operations()
        .values()
        .any(|status| status.gallery_element_name == element)
        || api.processing_elements().contains_key(element)
}

#[tokio::test]
async fn test_model_lists_converge_and_missing_models_are_queued() {
    let token = generate_token();
    let x = start_sync_node(&token, "a").await;
    let gossip = x.api.p2p().unwrap().gossip_addr();
    let y = start_sync_node(&seeded(&token, gossip), "b").await;

    eventually("x queues b", || has_operation_for(&x.api, "b")).await;
    eventually("y queues a", || has_operation_for(&y.api, "a")).await;

    let expected = serde_json::json!(["a", "b"]);
    eventually("shared list converges", || {
        x.api.ledger_value("shared_state", "models") == Some(expected.clone())
            && y.api.ledger_value("shared_state", "models") == Some(expected.clone())
    })
    .await;

    y.api.shutdown().await;
    x.api.shutdown().await;
}
