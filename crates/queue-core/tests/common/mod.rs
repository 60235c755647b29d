//! Shared integration-test setup: installs a `tracing_subscriber::fmt`
//! layer driven by `RUST_LOG`/`EnvFilter`, the same way a real embedding
//! binary would, so a failing scenario's spans/events are visible with
//! `RUST_LOG=debug cargo test -- --nocapture`.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
