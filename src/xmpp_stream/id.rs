//! Stream id generation.
//!
//! One background task keeps a small buffer of random identifiers filled. Components
//! that need an id hold a cloned `IdGenerator` handle and pull from it.

use std::sync::Arc;

use base64::Engine as _;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// Number of random bytes behind each identifier (before base64 encoding).
pub const ID_BYTES: usize = 20;

/// Number of pre-generated identifiers kept ready for consumers.
const ID_BUFFER_CAPACITY: usize = 16;

/// Handle to the process-wide id generator task.
///
/// Cloning the handle is cheap; the generator keeps running while any handle is alive.
#[derive(Clone)]
pub struct IdGenerator {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl IdGenerator {
    /// Spawn the generator task. Must be called from within a Tokio runtime.
    pub fn start() -> Self {
        Self::start_with_source(|buf| getrandom::getrandom(buf).map_err(|e| e.to_string()))
    }

    fn start_with_source<F>(mut fill: F) -> Self
    where
        F: FnMut(&mut [u8]) -> Result<(), String> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ID_BUFFER_CAPACITY);

        tokio::spawn(async move {
            loop {
                let mut raw = [0u8; ID_BYTES];
                if let Err(e) = fill(&mut raw) {
                    // Ids guard stream uniqueness; never hand out ids from a degraded source.
                    error!(error = %e, "Random source failed, aborting");
                    std::process::abort();
                }
                let id = base64::engine::general_purpose::STANDARD.encode(raw);
                if tx.send(id).await.is_err() {
                    debug!("All id generator handles dropped, stopping");
                    break;
                }
            }
        });

        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Take the next identifier, waiting for the generator if the buffer is empty.
    ///
    /// Only fails if the generator task itself is gone (e.g. its runtime shut down).
    pub async fn next_id(&self) -> Result<String, String> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| "Id generator task is not running".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_ids_decode_to_twenty_bytes() {
        let ids = IdGenerator::start();
        for _ in 0..4 {
            let id = ids.next_id().await.unwrap();
            let raw = base64::engine::general_purpose::STANDARD
                .decode(&id)
                .expect("id should be valid base64");
            assert_eq!(raw.len(), ID_BYTES);
        }
    }

    #[tokio::test]
    async fn test_ids_are_distinct() {
        let ids = IdGenerator::start();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(ids.next_id().await.unwrap()), "duplicate id issued");
        }
    }

    #[tokio::test]
    async fn test_clones_share_one_generator() {
        let ids = IdGenerator::start();
        let other = ids.clone();
        let a = ids.next_id().await.unwrap();
        let b = other.next_id().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_buffer_holds_at_most_capacity() {
        let (tx, rx) = std::sync::mpsc::channel();
        let ids = IdGenerator::start_with_source(move |buf| {
            buf.fill(0xAB);
            let _ = tx.send(());
            Ok(())
        });
        // Let the generator run until it blocks on the full buffer.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // One extra draw happens before the send that blocks.
        let produced = rx.try_iter().count();
        assert_eq!(produced, ID_BUFFER_CAPACITY + 1);

        let id = ids.next_id().await.unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(&id).unwrap(),
            vec![0xAB; ID_BYTES]
        );
    }
}
