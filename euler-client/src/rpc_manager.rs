//! Per-shard channel pool: tagged channels per replica, round-robin
//! dispatch, dead-host quarantine with timed re-probe, and live membership
//! updates from the shard monitor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use euler_types::parking_lot::{Condvar, Mutex};
use euler_types::tracing::{debug, info};

use crate::server_monitor::{ServerMonitor, ShardCallback};
use euler_types::models::ClientOptions;

/// One connection to one replica. Multiple channels may target the same
/// host, distinguished by a small tag.
pub trait Channel: Clone + Send + Sync + 'static {
    fn host_port(&self) -> &str;
}

struct PoolState<C> {
    channels: Vec<C>,
    /// Quarantined hosts with the time they went bad.
    bad_hosts: Vec<(String, Instant)>,
    next_replica: usize,
    shutdown: bool,
}

struct PoolShared<C> {
    state: Mutex<PoolState<C>>,
    cv: Condvar,
    notify: tokio::sync::Notify,
    factory: Box<dyn Fn(&str, usize) -> C + Send + Sync>,
    num_channels_per_host: usize,
    bad_host_timeout: Duration,
}

impl<C: Channel> PoolShared<C> {
    fn do_add_channels(&self, state: &mut PoolState<C>, host_port: &str) {
        for tag in 0..self.num_channels_per_host {
            state.channels.push((self.factory)(host_port, tag));
        }
    }

    fn do_remove_channels(&self, state: &mut PoolState<C>, host_port: &str) {
        state.channels.retain(|c| c.host_port() != host_port);
    }

    fn wake_waiters(&self) {
        self.cv.notify_all();
        self.notify.notify_waiters();
    }
}

/// The pool for one shard. Dropping it stops the cleaner and detaches the
/// monitor subscription.
pub struct RpcManager<C: Channel> {
    shared: Arc<PoolShared<C>>,
    monitor: Arc<dyn ServerMonitor>,
    shard_index: usize,
    callback: Arc<ShardCallback>,
    cleaner: Option<std::thread::JoinHandle<()>>,
}

impl<C: Channel> RpcManager<C> {
    /// Creates the pool, subscribes it to the shard's membership, and
    /// starts the quarantine cleaner.
    pub fn connect(
        monitor: Arc<dyn ServerMonitor>,
        shard_index: usize,
        options: &ClientOptions,
        factory: impl Fn(&str, usize) -> C + Send + Sync + 'static,
    ) -> Option<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                channels: Vec::new(),
                bad_hosts: Vec::new(),
                next_replica: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            notify: tokio::sync::Notify::new(),
            factory: Box::new(factory),
            num_channels_per_host: options.num_channels_per_host.max(1),
            bad_host_timeout: Duration::from_secs(options.bad_host_timeout_secs),
        });

        let add_shared = shared.clone();
        let remove_shared = shared.clone();
        let callback = ShardCallback::new(
            move |server| {
                let mut state = add_shared.state.lock();
                // The quarantine list is authoritative: a bad host only
                // comes back through the cleaner.
                if state.bad_hosts.iter().any(|(h, _)| h == server) {
                    debug!(server, "ignoring add for quarantined host");
                    return;
                }
                add_shared.do_add_channels(&mut state, server);
                drop(state);
                add_shared.wake_waiters();
            },
            move |server| {
                let mut state = remove_shared.state.lock();
                remove_shared.do_remove_channels(&mut state, server);
                state.bad_hosts.retain(|(h, _)| h != server);
            },
        );
        if !monitor.set_shard_callback(shard_index, &callback) {
            return None;
        }

        let cleaner_shared = shared.clone();
        let cleanup_interval = Duration::from_secs(options.bad_host_cleanup_interval_secs.max(1));
        let cleaner = std::thread::Builder::new()
            .name(format!("bad-host-cleaner-{shard_index}"))
            .spawn(move || cleaner_loop(cleaner_shared, cleanup_interval))
            .ok()?;

        Some(Self {
            shared,
            monitor,
            shard_index,
            callback,
            cleaner: Some(cleaner),
        })
    }

    /// Blocks until at least one live channel exists, then round-robins.
    /// Must not be called from an I/O thread.
    pub fn channel(&self) -> C {
        let mut state = self.shared.state.lock();
        self.shared.cv.wait_while(&mut state, |s| s.channels.is_empty());
        let index = state.next_replica % state.channels.len();
        state.next_replica = state.next_replica.wrapping_add(1);
        state.channels[index].clone()
    }

    /// Async form of `channel` for callers on the compute runtime.
    pub async fn channel_async(&self) -> C {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if !state.channels.is_empty() {
                    let index = state.next_replica % state.channels.len();
                    state.next_replica = state.next_replica.wrapping_add(1);
                    return state.channels[index].clone();
                }
            }
            notified.await;
        }
    }

    /// Quarantines a host: all its channels are dropped and it is recorded
    /// for timed readmission. Repeated calls for the same host are no-ops.
    pub fn move_to_bad(&self, host_port: &str) {
        let mut state = self.shared.state.lock();
        self.shared.do_remove_channels(&mut state, host_port);
        if !state.bad_hosts.iter().any(|(h, _)| h == host_port) {
            info!(host_port, "moving host to quarantine");
            state.bad_hosts.push((host_port.to_string(), Instant::now()));
        }
    }

    pub fn num_live_channels(&self) -> usize {
        self.shared.state.lock().channels.len()
    }
}

fn cleaner_loop<C: Channel>(shared: Arc<PoolShared<C>>, interval: Duration) {
    let mut state = shared.state.lock();
    loop {
        shared
            .cv
            .wait_while_for(&mut state, |s| !s.shutdown, interval);
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let expired: Vec<String> = state
            .bad_hosts
            .iter()
            .filter(|(_, since)| now.duration_since(*since) >= shared.bad_host_timeout)
            .map(|(host, _)| host.clone())
            .collect();
        if expired.is_empty() {
            continue;
        }
        state
            .bad_hosts
            .retain(|(_, since)| now.duration_since(*since) < shared.bad_host_timeout);
        for host in &expired {
            info!(host, "readmitting quarantined host");
            shared.do_add_channels(&mut state, host);
        }
        drop(state);
        shared.wake_waiters();
        state = shared.state.lock();
    }
}

impl<C: Channel> Drop for RpcManager<C> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(cleaner) = self.cleaner.take() {
            let _ = cleaner.join();
        }
        self.monitor
            .unset_shard_callback(self.shard_index, &self.callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_monitor::{Meta, ServerRegister, SimpleServerMonitor};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Clone)]
    struct MockChannel {
        host_port: String,
    }

    impl Channel for MockChannel {
        fn host_port(&self) -> &str {
            &self.host_port
        }
    }

    fn options(cleanup_secs: u64, timeout_secs: u64) -> ClientOptions {
        ClientOptions {
            bad_host_cleanup_interval_secs: cleanup_secs,
            bad_host_timeout_secs: timeout_secs,
            ..ClientOptions::default()
        }
    }

    fn manager(
        monitor: &Arc<SimpleServerMonitor>,
        options: &ClientOptions,
    ) -> RpcManager<MockChannel> {
        let monitor: Arc<dyn ServerMonitor> = monitor.clone();
        RpcManager::connect(monitor, 0, options, |host, _tag| MockChannel {
            host_port: host.to_string(),
        })
        .expect("subscription")
    }

    fn parallel_query(
        manager: &Arc<RpcManager<MockChannel>>,
        num_threads: usize,
        num_times: usize,
    ) -> HashMap<String, usize> {
        let mut handles = Vec::new();
        for _ in 0..num_threads {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                let mut local: HashMap<String, usize> = HashMap::new();
                for _ in 0..num_times {
                    *local.entry(manager.channel().host_port).or_default() += 1;
                }
                local
            }));
        }
        let mut counters = HashMap::new();
        for handle in handles {
            for (host, count) in handle.join().unwrap() {
                *counters.entry(host).or_default() += count;
            }
        }
        counters
    }

    #[test]
    fn round_robin_balances_across_replicas() {
        let monitor = SimpleServerMonitor::new();
        let manager = Arc::new(manager(&monitor, &options(1, 10)));
        for i in 0..3 {
            monitor.register_shard(0, &i.to_string(), Meta::new(), Meta::new());
        }
        // 8 threads x 1500 calls over 3 replicas.
        let counters = parallel_query(&manager, 8, 1500);
        let total: usize = counters.values().sum();
        assert_eq!(total, 12_000);
        for i in 0..3 {
            let count = counters[&i.to_string()];
            assert!(
                (3990..=4010).contains(&count),
                "replica {i} served {count} calls"
            );
        }
    }

    #[test]
    fn membership_changes_shift_the_distribution() {
        let monitor = SimpleServerMonitor::new();
        let manager = Arc::new(manager(&monitor, &options(1, 10)));
        monitor.register_shard(0, &"0".to_string(), Meta::new(), Meta::new());
        monitor.register_shard(0, &"1".to_string(), Meta::new(), Meta::new());
        let counters = parallel_query(&manager, 4, 500);
        assert_eq!(counters.len(), 2);

        monitor.register_shard(0, &"2".to_string(), Meta::new(), Meta::new());
        let counters = parallel_query(&manager, 4, 600);
        assert!(counters.contains_key("2"));

        monitor.deregister_shard(0, &"1".to_string());
        let counters = parallel_query(&manager, 4, 500);
        assert!(!counters.contains_key("1"));
    }

    #[test]
    fn quarantined_host_is_skipped_then_readmitted() {
        let monitor = SimpleServerMonitor::new();
        let manager = Arc::new(manager(&monitor, &options(1, 2)));
        for i in 0..3 {
            monitor.register_shard(0, &i.to_string(), Meta::new(), Meta::new());
        }

        manager.move_to_bad("2");
        // Idempotent.
        manager.move_to_bad("2");
        let counters = parallel_query(&manager, 4, 500);
        assert!(!counters.contains_key("2"));
        assert_eq!(counters.len(), 2);

        // A membership add for a quarantined host is ignored.
        monitor.deregister_shard(0, &"2".to_string());
        monitor.register_shard(0, &"2".to_string(), Meta::new(), Meta::new());
        assert_eq!(manager.num_live_channels(), 2);

        // Deregistering clears the quarantine record entirely; re-adding
        // is effective again.
        monitor.deregister_shard(0, &"2".to_string());
        monitor.register_shard(0, &"2".to_string(), Meta::new(), Meta::new());
        let counters = parallel_query(&manager, 4, 600);
        assert!(counters.contains_key("2"));
    }

    #[test]
    fn cleaner_readmits_after_timeout() {
        let monitor = SimpleServerMonitor::new();
        let manager = Arc::new(manager(&monitor, &options(1, 2)));
        for i in 0..3 {
            monitor.register_shard(0, &i.to_string(), Meta::new(), Meta::new());
        }
        manager.move_to_bad("1");
        assert_eq!(manager.num_live_channels(), 2);

        std::thread::sleep(Duration::from_secs(4));
        assert_eq!(manager.num_live_channels(), 3);
        let counters = parallel_query(&manager, 2, 300);
        assert!(counters.contains_key("1"));
    }

    #[test]
    fn tagged_channels_multiply_per_host() {
        let monitor = SimpleServerMonitor::new();
        let options = ClientOptions {
            num_channels_per_host: 3,
            ..ClientOptions::default()
        };
        let manager = manager(&monitor, &options);
        monitor.register_shard(0, &"0".to_string(), Meta::new(), Meta::new());
        assert_eq!(manager.num_live_channels(), 3);
    }
}
