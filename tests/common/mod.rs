//--------------------------------------------------------------------------------------------------
// Shared helpers for the integration tests
//--------------------------------------------------------------------------------------------------
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use crossbeam_channel::Receiver;
use eventbus::{EventBus, EventBusBuilder};
use tracing_subscriber::EnvFilter;

/// Upper bound for anything that should happen "soon"
pub const WAIT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Installs a fmt subscriber writing through the test harness. `RUST_LOG` overrides the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Builder with a small pool, tracing installed
pub fn builder() -> EventBusBuilder {
    init_tracing();
    EventBus::builder().source("test").async_pool_size(4)
}

pub fn test_bus() -> EventBus {
    builder().build().unwrap()
}

/// Asserts nothing arrives on `rx` for a little while
pub fn assert_quiet<T: std::fmt::Debug>(rx: &Receiver<T>) {
    if let Ok(value) = rx.recv_timeout(Duration::from_millis(200)) {
        panic!("unexpected message: {:?}", value);
    }
}
