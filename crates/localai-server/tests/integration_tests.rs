//! Integration tests for the localai-server binary.
//!
//! Each test starts the binary on an ephemeral port against a temporary
//! models directory and a local gallery index, then drives it over HTTP.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;

const GALLERY_INDEX: &str = "\
- name: tiny
  description: tiny test model
  license: mit
  tags: [test]
  config_file: |
    backend: llama-cpp
    context_size: 512
- name: other
  description: another entry
  config_file: |
    backend: whisper
";

/// Create a temporary directory holding a gallery index.
fn create_test_env() -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(temp_dir.path().join("index.yaml"), GALLERY_INDEX).unwrap();
    temp_dir
}

/// Check health endpoint.
async fn check_health(port: u16) -> bool {
    let client = reqwest::Client::new();
    if let Ok(response) = client
        .get(format!("http://127.0.0.1:{}/healthz", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        if let Ok(json) = response.json::<Value>().await {
            return json.get("status").and_then(|v| v.as_str()) == Some("ok");
        }
    }
    false
}

/// Wait for server to be ready.
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if check_health(port).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

struct ServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Start the binary and wait until `/healthz` answers.
async fn start_server(root: &Path, extra_env: &[(&str, &str)]) -> Result<ServerHandle, String> {
    let binary = if let Ok(path) = std::env::var("CARGO_BIN_EXE_localai-server") {
        PathBuf::from(path)
    } else {
        let current_exe = std::env::current_exe()
            .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
        let target_debug_dir = current_exe
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

        let mut fallback = target_debug_dir.join("localai-server");
        if cfg!(target_os = "windows") {
            fallback.set_extension("exe");
        }
        if !fallback.exists() {
            return Err(format!(
                "CARGO_BIN_EXE_localai-server not set and fallback binary not found at {}",
                fallback.display()
            ));
        }
        fallback
    };

    let galleries = json!([{
        "name": "local",
        "url": format!("file://{}", root.join("index.yaml").display()),
    }])
    .to_string();

    let mut command = tokio::process::Command::new(&binary);
    command
        .arg("--address")
        .arg("127.0.0.1:0")
        .arg("--models-path")
        .arg(root.join("models"))
        .arg("--backends-path")
        .arg(root.join("backends"))
        .arg("--galleries")
        .arg(galleries)
        .env_remove("LOCALAI_API_KEY")
        .env_remove("LOCALAI_P2P")
        .env_remove("LOCALAI_P2P_TOKEN")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    for (key, value) in extra_env {
        command.env(key, value);
    }
    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to spawn localai-server: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("LOCALAI_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid LOCALAI_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read localai-server stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port = discovered_port
        .ok_or_else(|| "LOCALAI_PORT line not emitted by localai-server".to_string())?;
    if !wait_for_server(port, 15).await {
        return Err(format!("localai-server failed health check on port {port}"));
    }

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(ServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

/// Poll a job until it reports `processed`.
async fn wait_for_job(client: &reqwest::Client, server: &ServerHandle, uuid: &str) -> Value {
    for _ in 0..200 {
        let status: Value = client
            .get(server.url(&format!("/models/jobs/{}", uuid)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["processed"] == true {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} never finished", uuid);
}

#[tokio::test]
async fn test_gallery_install_lifecycle() {
    let env = create_test_env();
    let server = start_server(env.path(), &[]).await.unwrap();
    let client = reqwest::Client::new();

    let available: Vec<Value> = client
        .get(server.url("/models/available?term=tiny"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0]["name"], "tiny");

    let job: Value = client
        .post(server.url("/models/apply"))
        .json(&json!({"id": "local@tiny"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let uuid = job["uuid"].as_str().unwrap().to_string();
    assert_eq!(job["status"], format!("/models/jobs/{}", uuid));

    let status = wait_for_job(&client, &server, &uuid).await;
    assert!(status["error"].is_null(), "{}", status);
    assert!(env.path().join("models").join("tiny.yaml").exists());

    let installed: Vec<String> = client
        .get(server.url("/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(installed, vec!["tiny".to_string()]);

    let job: Value = client
        .post(server.url("/models/delete/tiny"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let status = wait_for_job(&client, &server, job["uuid"].as_str().unwrap()).await;
    assert_eq!(status["deletion"], true);
    assert!(!env.path().join("models").join("tiny.yaml").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_gallery_entry_reports_error() {
    let env = create_test_env();
    let server = start_server(env.path(), &[]).await.unwrap();
    let client = reqwest::Client::new();

    let job: Value = client
        .post(server.url("/models/apply"))
        .json(&json!({"id": "local@missing"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let status = wait_for_job(&client, &server, job["uuid"].as_str().unwrap()).await;
    assert!(status["error"].is_string(), "{}", status);

    server.stop().await;
}

#[tokio::test]
async fn test_api_key_from_environment() {
    let env = create_test_env();
    let server = start_server(env.path(), &[("LOCALAI_API_KEY", "k1,k2")])
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let denied = client.get(server.url("/system")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = client
        .get(server.url("/system"))
        .bearer_auth("k2")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let system: Value = allowed.json().await.unwrap();
    assert!(system["models_path"].as_str().unwrap().ends_with("models"));

    server.stop().await;
}
