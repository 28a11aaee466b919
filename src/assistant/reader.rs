use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use super::AssistantSurface;

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("response still changing after {samples} samples")]
    Unsettled { samples: u32 },
}

/// Reads the latest response once it has stopped streaming: two
/// consecutive samples, one settle interval apart, must be identical.
pub struct ResponseReader<S> {
    surface: Arc<S>,
    settle_interval: Duration,
    max_samples: u32,
}

impl<S: AssistantSurface> ResponseReader<S> {
    pub fn new(surface: Arc<S>, settle_interval: Duration, max_samples: u32) -> Self {
        Self {
            surface,
            settle_interval,
            max_samples: max_samples.max(1),
        }
    }

    async fn sample(&self) -> Result<String> {
        // No message region yet reads as silence.
        Ok(self.surface.last_message_text().await?.unwrap_or_default())
    }

    /// Latest settled text. Fails with [`ReaderError::Unsettled`] when the
    /// text keeps changing for `max_samples` comparisons.
    pub async fn read_latest(&self) -> Result<String> {
        let mut previous = self.sample().await?;

        for _ in 0..self.max_samples {
            tokio::time::sleep(self.settle_interval).await;
            let current = self.sample().await?;
            if current == previous {
                return Ok(current);
            }
            debug!(
                "Last message still changing ({} -> {} bytes)",
                previous.len(),
                current.len()
            );
            previous = current;
        }

        Err(ReaderError::Unsettled {
            samples: self.max_samples,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted samples; the last one repeats forever.
    struct ScriptedSurface {
        samples: Mutex<VecDeque<Option<String>>>,
        reads: Mutex<u32>,
    }

    impl ScriptedSurface {
        fn new(samples: &[Option<&str>]) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples.iter().map(|s| s.map(str::to_string)).collect()),
                reads: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl AssistantSurface for ScriptedSurface {
        async fn submit(&self, _message: &str) -> Result<()> {
            Ok(())
        }

        async fn last_message_text(&self) -> Result<Option<String>> {
            *self.reads.lock().unwrap() += 1;
            let mut samples = self.samples.lock().unwrap();
            if samples.len() > 1 {
                Ok(samples.pop_front().unwrap())
            } else {
                Ok(samples.front().cloned().unwrap_or(None))
            }
        }
    }

    #[tokio::test]
    async fn test_waits_for_two_identical_samples() {
        let surface = ScriptedSurface::new(&[Some("Hel"), Some("Hello"), Some("Hello")]);
        let reader = ResponseReader::new(surface.clone(), Duration::ZERO, 10);

        assert_eq!(reader.read_latest().await.unwrap(), "Hello");
        assert_eq!(*surface.reads.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stable_text_needs_two_samples() {
        let surface = ScriptedSurface::new(&[Some("done")]);
        let reader = ResponseReader::new(surface.clone(), Duration::ZERO, 10);

        assert_eq!(reader.read_latest().await.unwrap(), "done");
        assert_eq!(*surface.reads.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_region_reads_empty() {
        let surface = ScriptedSurface::new(&[None]);
        let reader = ResponseReader::new(surface, Duration::ZERO, 10);

        assert_eq!(reader.read_latest().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_gives_up_when_never_stable() {
        let surface = ScriptedSurface::new(&[Some("a"), Some("ab"), Some("abc"), Some("abcd"), Some("abcd")]);
        let reader = ResponseReader::new(surface, Duration::ZERO, 2);

        let err = reader.read_latest().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReaderError>(),
            Some(ReaderError::Unsettled { samples: 2 })
        ));
    }
}
