//! Test helper utilities and common testing patterns

use std::sync::Once;
use std::time::Duration;
use tokio::time::sleep;

static INIT: Once = Once::new();

/// 初始化测试环境的日志记录，多次调用只生效一次
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for() {
        let counter = Arc::new(AtomicUsize::new(0));
        let polled = counter.clone();
        let result = TestEnv::wait_for(
            move || {
                let polled = polled.clone();
                async move { polled.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(result);
        assert!(counter.load(Ordering::SeqCst) >= 3);
    }
}
