//! Shared helpers for the integration tests.

// Each test binary compiles this module; not every binary uses every
// helper.
#![allow(dead_code)]

use cryo::PAGE_SIZE;
use once_cell::sync::Lazy;

/// Initialize tracing once for the whole test binary.
pub fn init_logging() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&INIT);
}

/// A page filled with one byte value.
pub fn filled_page(fill: u8) -> Vec<u8> {
    vec![fill; PAGE_SIZE]
}
