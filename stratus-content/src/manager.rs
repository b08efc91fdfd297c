use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use stratus_blob::BlobStore;

use crate::config::ContentConfig;
use crate::dal::RpcDal;
use crate::error::ContentResult;
use crate::types::UserId;
use crate::user::User;

/// Process-wide registry of content [`User`] objects.
///
/// Lookups are single-flight: concurrent cache misses for the same id
/// share one in-flight RPC and observe the identical `Arc<User>`.
pub struct ContentManager {
    dal: Arc<dyn RpcDal>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<ContentConfig>,
    users: Mutex<HashMap<UserId, Arc<OnceCell<Arc<User>>>>>,
}

impl ContentManager {
    pub fn new(
        dal: Arc<dyn RpcDal>,
        blobs: Arc<dyn BlobStore>,
        config: Arc<ContentConfig>,
    ) -> Self {
        Self {
            dal,
            blobs,
            config,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a user by id.
    ///
    /// With `required` false only the cache is consulted; with `required`
    /// true a miss loads the user over RPC, coalescing concurrent loads
    /// of the same id into a single call.
    pub async fn get_user_by_id(
        &self,
        id: UserId,
        required: bool,
    ) -> ContentResult<Option<Arc<User>>> {
        let cell = {
            let mut users = self.users.lock();
            users.entry(id).or_default().clone()
        };
        if !required {
            return Ok(cell.get().cloned());
        }
        let user = cell
            .get_or_try_init(|| async {
                let info = self.dal.get_user(id).await?;
                Ok::<_, crate::error::ContentError>(Arc::new(User::new(
                    self.dal.clone(),
                    self.blobs.clone(),
                    self.config.clone(),
                    info,
                )))
            })
            .await?;
        Ok(Some(user.clone()))
    }

    /// Drop a user from the cache (session teardown)
    pub fn evict(&self, id: UserId) {
        self.users.lock().remove(&id);
    }

    /// Number of users currently cached
    pub fn cached_count(&self) -> usize {
        self.users
            .lock()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::MemoryDal;
    use stratus_blob::MemoryBlobStore;

    fn manager(dal: &Arc<MemoryDal>) -> ContentManager {
        ContentManager::new(
            dal.clone() as Arc<dyn RpcDal>,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(ContentConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_get_user_by_id() {
        let dal = Arc::new(MemoryDal::new());
        let info = dal.add_user("fred", 1 << 20);
        let cm = manager(&dal);

        // Not cached yet: a non-required lookup stays empty.
        assert!(cm.get_user_by_id(info.id, false).await.unwrap().is_none());

        let user = cm
            .get_user_by_id(info.id, true)
            .await
            .unwrap()
            .expect("required lookup loads the user");
        assert_eq!(user.username, "fred");
        assert_eq!(cm.cached_count(), 1);

        // Now it is cached for non-required lookups too.
        let again = cm.get_user_by_id(info.id, false).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&user, &again));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_rpc() {
        let dal = Arc::new(MemoryDal::new());
        let info = dal.add_user("fred", 1 << 20);
        let cm = Arc::new(manager(&dal));

        // Hold the first fetch in flight until both callers have started.
        let gate = dal.gate_user_fetches();

        let first = tokio::spawn({
            let cm = cm.clone();
            async move { cm.get_user_by_id(info.id, true).await }
        });
        let second = tokio::spawn({
            let cm = cm.clone();
            async move { cm.get_user_by_id(info.id, true).await }
        });
        tokio::task::yield_now().await;
        gate.add_permits(2);

        let u1 = first.await.unwrap().unwrap().unwrap();
        let u2 = second.await.unwrap().unwrap().unwrap();

        assert!(Arc::ptr_eq(&u1, &u2));
        assert_eq!(dal.user_fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user_fails_required_lookup() {
        let dal = Arc::new(MemoryDal::new());
        let cm = manager(&dal);
        assert!(cm.get_user_by_id(UserId(404), true).await.is_err());
    }

    #[tokio::test]
    async fn test_evict_drops_the_cache_entry() {
        let dal = Arc::new(MemoryDal::new());
        let info = dal.add_user("fred", 1 << 20);
        let cm = manager(&dal);

        cm.get_user_by_id(info.id, true).await.unwrap();
        assert_eq!(cm.cached_count(), 1);
        cm.evict(info.id);
        assert!(cm.get_user_by_id(info.id, false).await.unwrap().is_none());
    }
}
