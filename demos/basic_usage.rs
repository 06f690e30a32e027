// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic tts-cache usage example.
//!
//! Demonstrates:
//! 1. Building an orchestrator with memory + SQLite tiers
//! 2. A miss followed by a cache hit
//! 3. Upstream failures tripping the circuit breaker
//! 4. Degrading to text-only output
//! 5. Displaying metrics
//!
//! Runs offline against a simulated synthesis API. Set `TTS_CACHE_API_KEY`
//! to call the real HTTP API instead.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tts_cache::{
    ClientError, HttpSynthesisClient, SynthesisClient, SynthesisOrchestrator, TtsCacheConfig,
};

/// Pretends to be the synthesis API; flip `down` to simulate an outage.
struct SimulatedApi {
    down: AtomicBool,
}

#[async_trait]
impl SynthesisClient for SimulatedApi {
    async fn synthesize(&self, text: &str) -> Result<Bytes, ClientError> {
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        if self.down.load(Ordering::SeqCst) {
            return Err(ClientError::from_status(503, "simulated outage"));
        }
        Ok(Bytes::from(format!("ID3 fake mp3 for: {}", text)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             tts-cache: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure
    // ─────────────────────────────────────────────────────────────────────────
    let db_path = std::env::temp_dir().join("tts_cache_demo.db");
    let mut config = TtsCacheConfig::from_env()?;
    config.persistent_path.get_or_insert_with(|| db_path.to_string_lossy().into_owned());
    // Short retries so the outage section finishes quickly
    config.retry_server_error_base_ms = 50;
    config.retry_server_error_max_ms = 200;

    let simulated = Arc::new(SimulatedApi {
        down: AtomicBool::new(false),
    });
    let client: Arc<dyn SynthesisClient> = if config.api_key.is_some() {
        println!("🔑 API key found, using the HTTP client");
        Arc::new(HttpSynthesisClient::new(config.client_config())?)
    } else {
        println!("🧪 No API key, using the simulated API");
        simulated.clone()
    };

    let tts = SynthesisOrchestrator::from_config(&config, client).await?;
    println!("   tiers: {:?}\n", tts.cache().tier_names());
    tts.clear_cache().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Miss, then hit
    // ─────────────────────────────────────────────────────────────────────────
    println!("🔊 Synthesizing...");
    for _ in 0..2 {
        let result = tts.synthesize("Hello Bitcoin").await?;
        println!(
            "   {} bytes, cached={}, {}ms",
            result.audio.len(),
            result.was_cached,
            result.synthesis_time_ms()
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Outage
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Simulating an API outage...");
    simulated.down.store(true, Ordering::SeqCst);
    for i in 0..8 {
        let text = format!("Block height update number {}", i);
        match tts.synthesize_best_effort(&text).await {
            Some(result) => println!("   [{}] audio ({} bytes)", i, result.audio.len()),
            None => println!("   [{}] text only: {}  (circuit: {})", i, text, tts.circuit_state()),
        }
    }

    // Cached lines keep working while the API is down
    let cached = tts.synthesize("Hello Bitcoin").await?;
    println!("   cached line still served: cached={}", cached.was_cached);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let stats = tts.cache_stats().await;
    println!("\n📊 Cache hit rate: {:.0}%", stats.hit_rate() * 100.0);
    for tier in &stats.tiers {
        println!(
            "   {:<7} hits={} misses={} errors={}",
            tier.name, tier.hits, tier.misses, tier.errors
        );
    }
    let snap = tts.circuit_snapshot();
    println!(
        "   breaker {} ({} failures / {} in window)",
        snap.state, snap.window_failures, snap.window_len
    );

    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump counters and gauges, one line each
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key
                .labels()
                .map(|l| format!("{}={}", l.key(), l.value()))
                .collect();
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{{{}}} = {}", key.name(), labels.join(","), value)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
