//! Synthetic log lines for exercising a viewer by hand.

use std::{sync::Arc, time::Duration};

use remote_log_core::LogBuffer;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::Level;

use crate::command::CommandError;

/// Format sample line `index`, cycling INFO, WARN, ERROR.
#[must_use]
pub fn sample_line(index: usize) -> String {
    let level = match index % 3 {
        0 => Level::INFO,
        1 => Level::WARN,
        _ => Level::ERROR,
    };
    format!("{} sample: {index}] Sample {} message", level.as_str(), level.as_str())
}

/// Append `count` sample lines to `buffer`, `interval` apart, on a
/// background task.
///
/// The buffer lock is only taken for each append, never across a sleep.
///
/// # Errors
/// Returns error if called outside a Tokio runtime.
pub fn spawn_samples(
    buffer: Arc<LogBuffer>,
    count: usize,
    interval: Duration,
) -> Result<JoinHandle<()>, CommandError> {
    let runtime = Handle::try_current().map_err(|_| CommandError::NoRuntime)?;
    Ok(runtime.spawn(async move {
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            buffer.append_line(&sample_line(i));
        }
        tracing::debug!(count, "Log samples finished");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_line_levels() {
        assert_eq!(sample_line(0), "INFO sample: 0] Sample INFO message");
        assert_eq!(sample_line(1), "WARN sample: 1] Sample WARN message");
        assert_eq!(sample_line(2), "ERROR sample: 2] Sample ERROR message");
        assert_eq!(sample_line(3), "INFO sample: 3] Sample INFO message");
    }

    #[tokio::test]
    async fn test_samples_append_in_order() {
        let buffer = Arc::new(LogBuffer::default());

        let task = spawn_samples(Arc::clone(&buffer), 4, Duration::from_millis(5)).unwrap();
        task.await.unwrap();

        let lines = buffer.drain_lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "INFO sample: 0] Sample INFO message\n");
        assert_eq!(lines[3], "INFO sample: 3] Sample INFO message\n");
    }

    #[tokio::test]
    async fn test_zero_samples() {
        let buffer = Arc::new(LogBuffer::default());
        spawn_samples(Arc::clone(&buffer), 0, Duration::from_millis(5))
            .unwrap()
            .await
            .unwrap();
        assert!(buffer.is_empty());
    }
}
