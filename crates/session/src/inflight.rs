use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::trace;

/// Joins concurrent calls for the same operation onto one future.
///
/// The first caller for a key creates the request; callers arriving while
/// it is outstanding await the same shared result. The entry is removed
/// once the request resolves, so the next call starts fresh.
pub struct InflightRequests<T>
where
    T: Clone + Send + Sync + 'static,
{
    pending: Mutex<HashMap<&'static str, Shared<BoxFuture<'static, T>>>>,
}

impl<T> InflightRequests<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &'static str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut pending = self.lock();
            match pending.get(key) {
                Some(existing) => {
                    trace!(key, "joining in-flight request");
                    existing.clone()
                }
                None => {
                    let request = make().boxed().shared();
                    pending.insert(key, request.clone());
                    request
                }
            }
        };

        let output = shared.clone().await;

        let mut pending = self.lock();
        if pending
            .get(key)
            .is_some_and(|current| Shared::ptr_eq(current, &shared))
        {
            pending.remove(key);
        }
        output
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, Shared<BoxFuture<'static, T>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for InflightRequests<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
