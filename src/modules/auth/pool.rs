use std::sync::Arc;

use log::debug;
use tokio::sync::Semaphore;
use zeroize::Zeroizing;

use super::password::{self, DerivationParams, DerivedKey, PasswordError};

/// Runs password derivations off the async workers, at most `max_concurrent`
/// at a time, so a burst of logins cannot exhaust CPU and memory.
#[derive(Clone)]
pub struct DerivationPool {
    permits: Arc<Semaphore>,
    params: DerivationParams,
}

impl DerivationPool {
    pub fn new(params: DerivationParams, max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            params,
        }
    }

    /// Permits not currently held by a running derivation
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn derive(
        &self,
        password: Zeroizing<Vec<u8>>,
        salt: Vec<u8>,
    ) -> Result<DerivedKey, PasswordError> {
        let params = self.params.clone();
        self.run(move || password::derive(&password, &salt, &params))
            .await
    }

    pub async fn verify(
        &self,
        password: Zeroizing<Vec<u8>>,
        salt: Vec<u8>,
        expected_hash: Zeroizing<Vec<u8>>,
    ) -> Result<bool, PasswordError> {
        let params = self.params.clone();
        self.run(move || password::verify(&password, &salt, &expected_hash, &params))
            .await
    }

    /// Take one slot without running anything, as a busy derivation would
    #[cfg(test)]
    pub(crate) async fn occupy(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    async fn run<T, F>(&self, job: F) -> Result<T, PasswordError>
    where
        F: FnOnce() -> Result<T, PasswordError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PasswordError::Worker(e.to_string()))?;

        debug!("Derivation started ({} slots left)", self.available());

        // The permit moves into the blocking task so it is held until the
        // derivation finishes, even if the awaiting future is dropped
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| PasswordError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::auth::password::generate_salt;

    fn secret(bytes: &[u8]) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_pool_matches_direct_derivation() {
        let params = DerivationParams::for_tests();
        let pool = DerivationPool::new(params.clone(), 2);
        let salt = generate_salt(32).unwrap();

        let pooled = pool.derive(secret(b"correct-horse"), salt.clone()).await.unwrap();
        let direct = password::derive(b"correct-horse", &salt, &params).unwrap();
        assert_eq!(*pooled, *direct);

        assert!(pool
            .verify(secret(b"correct-horse"), salt.clone(), direct.clone())
            .await
            .unwrap());
        assert!(!pool
            .verify(secret(b"wrong"), salt, direct)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_permits_are_returned() {
        let pool = DerivationPool::new(DerivationParams::for_tests(), 2);
        let salt = generate_salt(32).unwrap();

        let jobs: Vec<_> = (0..6)
            .map(|i| {
                let pool = pool.clone();
                let salt = salt.clone();
                tokio::spawn(async move {
                    pool.derive(secret(format!("pw{}", i).as_bytes()), salt).await
                })
            })
            .collect();

        for job in jobs {
            assert!(job.await.unwrap().is_ok());
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let pool = DerivationPool::new(DerivationParams::for_tests(), 1);
        let result = pool.derive(secret(b"pw"), b"abc".to_vec()).await;
        assert!(matches!(result, Err(PasswordError::Derivation(_))));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_permit_outlives_dropped_caller() {
        let pool = DerivationPool::new(DerivationParams::for_tests(), 1);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let caller = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(move || {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                    Ok::<_, PasswordError>(())
                })
                .await
            })
        };

        started_rx.await.unwrap();
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // The blocking job is still running, so its slot stays taken
        assert_eq!(pool.available(), 0);

        release_tx.send(()).unwrap();
        let permit = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pool.permits.clone().acquire_owned(),
        )
        .await
        .unwrap()
        .unwrap();
        drop(permit);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let pool = DerivationPool::new(DerivationParams::for_tests(), 0);
        assert_eq!(pool.available(), 1);
    }
}
