use crate::config::{Config, TransportMode};
use crate::engine::Engine;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Batch-transport config with small pages and a fast transporter, so
/// tests exercise page rolls and transports quickly.
pub fn batch_config() -> Config {
    init_tracing();
    Config {
        buffer_page_size: 1024,
        block_size_threshold: 10_000,
        transport_interval: Duration::from_millis(1),
        transport_rate: 64,
        batch_size: 64,
        // Keep the watchdog quiet during tests.
        hung_detection_frequency: Duration::from_secs(60),
        hung_detection_threshold: Duration::from_secs(600),
        allowable_inactivity_threshold: Duration::from_secs(600),
        ..Config::default()
    }
}

/// Streaming-transport variant of [`batch_config`].
pub fn streaming_config() -> Config {
    Config {
        transport_mode: TransportMode::Streaming,
        ..batch_config()
    }
}

/// Blocks until the engine's buffer fully drains (or panics after 10
/// seconds).
pub fn wait_for_transport(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let pending = engine.stats().unwrap().pending_writes;
        if pending == 0 {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "transport did not drain; {pending} writes still pending"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}
