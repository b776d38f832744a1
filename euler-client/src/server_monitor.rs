//! Shard membership: pluggable discovery behind the `ServerMonitor`
//! contract. Readers of cluster meta block until the data has been
//! observed at least once; subscribers attached to a shard immediately see
//! its already-known servers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use euler_types::parking_lot::{Condvar, Mutex};

pub type Meta = HashMap<String, String>;
pub type Server = String;

/// Membership-change subscriber. `on_add_server` also fires synchronously
/// for servers known before the subscription.
pub struct ShardCallback {
    pub on_add_server: Box<dyn Fn(&Server) + Send + Sync>,
    pub on_remove_server: Box<dyn Fn(&Server) + Send + Sync>,
}

impl ShardCallback {
    pub fn new(
        on_add_server: impl Fn(&Server) + Send + Sync + 'static,
        on_remove_server: impl Fn(&Server) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            on_add_server: Box::new(on_add_server),
            on_remove_server: Box::new(on_remove_server),
        })
    }
}

pub trait ServerMonitor: Send + Sync {
    /// Blocks until the global meta has been published, then returns the
    /// value for `key` if present.
    fn get_meta(&self, key: &str) -> Option<String>;

    fn get_num_shards(&self) -> Option<usize> {
        self.get_meta("num_shards").and_then(|v| v.parse().ok())
    }

    /// Blocks until the shard's meta has been published.
    fn get_shard_meta(&self, shard: usize, key: &str) -> Option<String>;

    /// Subscribes; replays `on_add_server` for every currently-known
    /// server of the shard before returning. Re-adding the same callback
    /// fails.
    fn set_shard_callback(&self, shard: usize, callback: &Arc<ShardCallback>) -> bool;

    /// Unsubscribes without firing `on_remove_server` for the residue.
    fn unset_shard_callback(&self, shard: usize, callback: &Arc<ShardCallback>) -> bool;
}

#[derive(Default)]
struct ShardInfo {
    meta: Option<Meta>,
    servers: BTreeSet<Server>,
    callbacks: Vec<Arc<ShardCallback>>,
}

#[derive(Default)]
struct MonitorState {
    meta: Option<Meta>,
    shards: HashMap<usize, ShardInfo>,
}

/// The bookkeeping every concrete monitor shares; mutators fan out to
/// subscribers under the lock.
#[derive(Default)]
pub struct ServerMonitorBase {
    state: Mutex<MonitorState>,
    cv: Condvar,
}

impl ServerMonitorBase {
    pub fn update_meta(&self, new_meta: Meta) {
        let mut state = self.state.lock();
        state.meta = Some(new_meta);
        self.cv.notify_all();
    }

    pub fn update_shard_meta(&self, shard: usize, new_meta: Meta) {
        let mut state = self.state.lock();
        state.shards.entry(shard).or_default().meta = Some(new_meta);
        self.cv.notify_all();
    }

    pub fn add_shard_server(&self, shard: usize, server: &Server) {
        let mut state = self.state.lock();
        let info = state.shards.entry(shard).or_default();
        for callback in &info.callbacks {
            (callback.on_add_server)(server);
        }
        info.servers.insert(server.clone());
        self.cv.notify_all();
    }

    pub fn remove_shard_server(&self, shard: usize, server: &Server) {
        let mut state = self.state.lock();
        let info = state.shards.entry(shard).or_default();
        for callback in &info.callbacks {
            (callback.on_remove_server)(server);
        }
        info.servers.remove(server);
    }
}

impl ServerMonitor for ServerMonitorBase {
    fn get_meta(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        self.cv.wait_while(&mut state, |s| s.meta.is_none());
        state.meta.as_ref().and_then(|m| m.get(key).cloned())
    }

    fn get_shard_meta(&self, shard: usize, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        self.cv.wait_while(&mut state, |s| {
            s.shards.get(&shard).map_or(true, |info| info.meta.is_none())
        });
        state
            .shards
            .get(&shard)
            .and_then(|info| info.meta.as_ref())
            .and_then(|m| m.get(key).cloned())
    }

    fn set_shard_callback(&self, shard: usize, callback: &Arc<ShardCallback>) -> bool {
        let mut state = self.state.lock();
        let info = state.shards.entry(shard).or_default();
        if info
            .callbacks
            .iter()
            .any(|existing| Arc::ptr_eq(existing, callback))
        {
            return false;
        }
        for server in &info.servers {
            (callback.on_add_server)(server);
        }
        info.callbacks.push(callback.clone());
        true
    }

    fn unset_shard_callback(&self, shard: usize, callback: &Arc<ShardCallback>) -> bool {
        let mut state = self.state.lock();
        let info = state.shards.entry(shard).or_default();
        let before = info.callbacks.len();
        info.callbacks.retain(|existing| !Arc::ptr_eq(existing, callback));
        info.callbacks.len() != before
    }
}

/// Registration side of discovery, implemented by in-process monitors and
/// by servers' registration hooks.
pub trait ServerRegister: Send + Sync {
    fn register_shard(&self, shard: usize, server: &Server, meta: Meta, shard_meta: Meta) -> bool;
    fn deregister_shard(&self, shard: usize, server: &Server) -> bool;
}

/// In-process monitor: the registration and monitoring sides of one
/// cluster, for tests and statically-configured deployments.
#[derive(Default)]
pub struct SimpleServerMonitor {
    base: ServerMonitorBase,
    registered: Mutex<HashMap<usize, BTreeSet<Server>>>,
}

impl SimpleServerMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ServerMonitor for SimpleServerMonitor {
    fn get_meta(&self, key: &str) -> Option<String> {
        self.base.get_meta(key)
    }

    fn get_shard_meta(&self, shard: usize, key: &str) -> Option<String> {
        self.base.get_shard_meta(shard, key)
    }

    fn set_shard_callback(&self, shard: usize, callback: &Arc<ShardCallback>) -> bool {
        self.base.set_shard_callback(shard, callback)
    }

    fn unset_shard_callback(&self, shard: usize, callback: &Arc<ShardCallback>) -> bool {
        self.base.unset_shard_callback(shard, callback)
    }
}

impl ServerRegister for SimpleServerMonitor {
    fn register_shard(&self, shard: usize, server: &Server, meta: Meta, shard_meta: Meta) -> bool {
        {
            let mut registered = self.registered.lock();
            if !registered.entry(shard).or_default().insert(server.clone()) {
                return false;
            }
        }
        self.base.add_shard_server(shard, server);
        self.base.update_meta(meta);
        self.base.update_shard_meta(shard, shard_meta);
        true
    }

    fn deregister_shard(&self, shard: usize, server: &Server) -> bool {
        {
            let mut registered = self.registered.lock();
            if !registered.entry(shard).or_default().remove(server) {
                return false;
            }
        }
        self.base.remove_shard_server(shard, server);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn subscribing_after_registration_replays_servers() {
        let monitor = SimpleServerMonitor::new();
        for i in 0..3 {
            assert!(monitor.register_shard(0, &i.to_string(), Meta::new(), Meta::new()));
        }
        let count = Arc::new(AtomicI32::new(0));
        let add = count.clone();
        let remove = count.clone();
        let callback = ShardCallback::new(
            move |_| {
                add.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                remove.fetch_sub(1, Ordering::SeqCst);
            },
        );
        assert!(monitor.set_shard_callback(0, &callback));
        // Replay happened synchronously inside the subscribe call.
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Unsubscribe fires nothing for the residual servers.
        assert!(monitor.unset_shard_callback(0, &callback));
        for i in (0..3).rev() {
            assert!(monitor.deregister_shard(0, &i.to_string()));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callbacks_track_changes_in_order() {
        let monitor = SimpleServerMonitor::new();
        let count = Arc::new(AtomicI32::new(0));
        let add = count.clone();
        let remove = count.clone();
        let expected_add = Arc::new(AtomicI32::new(0));
        let expected = expected_add.clone();
        let callback = ShardCallback::new(
            move |server| {
                assert_eq!(server, &expected.load(Ordering::SeqCst).to_string());
                expected.fetch_add(1, Ordering::SeqCst);
                add.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                remove.fetch_sub(1, Ordering::SeqCst);
            },
        );
        assert!(monitor.set_shard_callback(0, &callback));
        for i in 0..3 {
            assert!(monitor.register_shard(
                0,
                &i.to_string(),
                Meta::from([("key".to_string(), "value".to_string())]),
                Meta::from([("shard_key".to_string(), "shard_value".to_string())]),
            ));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.get_meta("key").as_deref(), Some("value"));
        assert_eq!(
            monitor.get_shard_meta(0, "shard_key").as_deref(),
            Some("shard_value")
        );

        for i in (0..3).rev() {
            assert!(monitor.deregister_shard(0, &i.to_string()));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Duplicate registration is rejected.
        assert!(monitor.register_shard(0, &"0".to_string(), Meta::new(), Meta::new()));
        assert!(!monitor.register_shard(0, &"0".to_string(), Meta::new(), Meta::new()));
    }
}
