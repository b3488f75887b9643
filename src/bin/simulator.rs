//! Local load run: starts the mock backend and the gateway, fires a burst of
//! chat requests, and reports how they were answered.
//!
//! Expects `cargo build` to have produced the binaries under `target/debug`.

use anyhow::Context;
use std::collections::BTreeMap;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task;

const GATEWAY: &str = "http://127.0.0.1:8080";
const MOCK_PORT: &str = "3001";
const REQUESTS: usize = 100;

// Kills the child on exit.
struct ProcessGuard(Child);

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Outcome {
    Fresh,
    Cached,
    RateLimited,
    Failed(u16),
    Transport,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Starting simulation...");

    let config_path = std::env::temp_dir().join("chat-edge-simulator.toml");
    std::fs::write(
        &config_path,
        format!(
            "[server]\naddress = \"127.0.0.1:8080\"\n\n[models]\nbase_url = \"http://127.0.0.1:{MOCK_PORT}\"\ncandidates = [\"gemini-1.5-flash-latest\", \"gemini-1.5-flash\"]\n"
        ),
    )
    .context("failed to write simulator config")?;

    let _mock = ProcessGuard(
        Command::new("./target/debug/mock_provider")
            .args([
                "--port",
                MOCK_PORT,
                "--latency-ms",
                "50",
                "--error-rate",
                "0.05",
                "--missing",
                "gemini-1.5-flash-latest",
            ])
            .spawn()
            .context("failed to start mock_provider")?,
    );

    let _gateway = ProcessGuard(
        Command::new("./target/debug/chat-edge")
            .arg("--config")
            .arg(&config_path)
            .env("GOOGLE_API_KEY", "AIzaSimulatorKey")
            .spawn()
            .context("failed to start chat-edge")?,
    );

    println!("Waiting for startup...");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let client = reqwest::Client::new();
    match client.get(format!("{GATEWAY}/health")).send().await {
        Ok(resp) => println!("Health: {}", resp.status()),
        Err(e) => println!("Health check failed: {e}"),
    }

    println!("Sending {REQUESTS} concurrent requests...");
    let outcomes = Arc::new(Mutex::new(BTreeMap::<Outcome, usize>::new()));
    let start_time = Instant::now();

    let mut tasks = Vec::with_capacity(REQUESTS);
    for i in 0..REQUESTS {
        let client = client.clone();
        let outcomes = outcomes.clone();

        // First half repeats one question from one user to exercise the
        // cache and that user's rate window.
        let body = if i < REQUESTS / 2 {
            serde_json::json!({
                "message": "How do I calculate the margin on a product?",
                "userId": "sim-shared"
            })
        } else {
            serde_json::json!({
                "message": format!("Give me a quick tip number {i}"),
                "userId": format!("sim-{i}")
            })
        };

        tasks.push(task::spawn(async move {
            let outcome = match client.post(format!("{GATEWAY}/chat")).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let reply: serde_json::Value = resp.json().await.unwrap_or_default();
                    if reply["cached"].as_bool().unwrap_or(false) {
                        Outcome::Cached
                    } else {
                        Outcome::Fresh
                    }
                }
                Ok(resp) if resp.status().as_u16() == 429 => Outcome::RateLimited,
                Ok(resp) => Outcome::Failed(resp.status().as_u16()),
                Err(_) => Outcome::Transport,
            };
            *outcomes.lock().await.entry(outcome).or_default() += 1;
        }));
    }

    for t in tasks {
        let _ = t.await;
    }
    let duration = start_time.elapsed();

    println!("--- Results ---");
    for (outcome, count) in outcomes.lock().await.iter() {
        println!("{outcome:?}: {count}");
    }
    println!("Total time: {duration:?}");
    println!("RPS: {:.2}", REQUESTS as f64 / duration.as_secs_f64());

    let _ = std::fs::remove_file(&config_path);
    Ok(())
}
