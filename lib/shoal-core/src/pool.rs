//! The server pool: the set of backend descriptors for one listening
//! front, their failure accounting, ejection state, and the hash ring built
//! over whichever subset is currently live.

use crate::config::PoolConfig;
use crate::ring::{Distribution, Ring, RingServer};
use shoal_support::hash::HashFn;
use shoal_support::time::timestamp_secs;

pub struct Backend {
    pub name: String,
    pub address: std::net::SocketAddr,
    pub weight: u32,
    pub failure_count: u32,
    pub ejected_until: u64,
}

impl Backend {
    pub fn is_ejected(&self, now: u64) -> bool {
        self.ejected_until > now
    }
}

pub struct ServerPool {
    pub backends: Vec<Backend>,
    pub hash_fn: HashFn,
    pub distribution: Distribution,
    pub auto_eject_hosts: bool,
    pub server_failure_limit: u32,
    pub server_retry_timeout_secs: u64,
    pub server_connections: u32,
    pub request_timeout_ms: u64,
    ring: Ring,
    /// Maps a ring server index (over the currently live subset) back to
    /// its index in `backends`.
    live_index_map: Vec<usize>,
}

impl ServerPool {
    pub fn from_config(config: &PoolConfig) -> ServerPool {
        let backends: Vec<Backend> = config
            .servers
            .iter()
            .enumerate()
            .map(|(i, spec)| Backend {
                name: spec.name.clone().unwrap_or_else(|| format!("server-{}", i)),
                address: spec.address.parse().expect("validated at config load"),
                weight: spec.weight,
                failure_count: 0,
                ejected_until: 0,
            })
            .collect();

        let hash_fn = HashFn::from_name(&config.hash).expect("validated at config load");
        let distribution =
            Distribution::from_name(&config.distribution).expect("validated at config load");

        let mut pool = ServerPool {
            backends,
            hash_fn,
            distribution,
            auto_eject_hosts: config.auto_eject_hosts,
            server_failure_limit: config.server_failure_limit,
            server_retry_timeout_secs: config.server_retry_timeout_ms / 1000,
            server_connections: config.server_connections,
            request_timeout_ms: config.timeout_ms,
            ring: Ring::build(&[], Distribution::Modula),
            live_index_map: Vec::new(),
        };
        pool.rebuild_ring();
        pool
    }

    fn live_backends(&self, now: u64) -> Vec<(usize, &Backend)> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, b)| !self.auto_eject_hosts || !b.is_ejected(now))
            .collect()
    }

    fn rebuild_ring(&mut self) {
        let now = timestamp_secs();
        let live = self.live_backends(now);
        let ring_servers: Vec<RingServer> = live
            .iter()
            .map(|(_, b)| RingServer {
                name: b.name.clone(),
                weight: b.weight,
            })
            .collect();
        let live_index_map: Vec<usize> = live.iter().map(|(i, _)| *i).collect();
        drop(live);

        self.ring = Ring::build(&ring_servers, self.distribution);
        self.live_index_map = live_index_map;
    }

    /// Map a key to a backend index in `self.backends`, or `None` if no
    /// backend is currently eligible to serve it.
    pub fn route(&self, key: &[u8]) -> Option<usize> {
        let hash = self.hash_fn.hash(key);
        let ring_index = self.ring.lookup(hash)?;
        self.live_index_map.get(ring_index).copied()
    }

    /// Record a failure against `backend`. Ejects it if the failure limit
    /// is reached within the retry window, and rebuilds the ring if that
    /// changes live membership. Returns the backoff duration in
    /// milliseconds if this call just ejected the backend, so the caller
    /// can schedule a `TimerKind::ReconnectBackoff` to restore it promptly
    /// instead of waiting on the next periodic sweep.
    pub fn record_failure(&mut self, backend: usize) -> Option<u64> {
        let now = timestamp_secs();
        let (changed, backoff_ms) = {
            let b = &mut self.backends[backend];
            b.failure_count += 1;
            if self.server_failure_limit > 0 && b.failure_count >= self.server_failure_limit {
                let was_live = !b.is_ejected(now);
                b.ejected_until = now + self.server_retry_timeout_secs;
                (was_live, was_live.then(|| self.server_retry_timeout_secs * 1000))
            } else {
                (false, None)
            }
        };
        if changed && self.auto_eject_hosts {
            self.rebuild_ring();
        }
        backoff_ms
    }

    /// Restore a single backend once its eject window has passed, per a
    /// `TimerKind::ReconnectBackoff` firing. No-op (and no ring rebuild) if
    /// the backend isn't currently ejected, e.g. if a periodic sweep beat
    /// the timer to it.
    pub fn restore_one(&mut self, backend: usize) {
        let now = timestamp_secs();
        if let Some(b) = self.backends.get_mut(backend) {
            if b.ejected_until != 0 && b.ejected_until <= now {
                b.ejected_until = 0;
                self.rebuild_ring();
            }
        }
    }

    /// Record a success against `backend`, resetting its failure count and
    /// restoring it to the ring if it had been ejected and its window has
    /// since passed (the natural path is simply that `is_ejected` becomes
    /// false and the next periodic rebuild or explicit restore picks it up).
    pub fn record_success(&mut self, backend: usize) {
        self.backends[backend].failure_count = 0;
    }

    /// Sweep for backends whose eject window has passed and restore them to
    /// the ring. Called periodically by the context loop.
    pub fn restore_expired_ejections(&mut self) {
        let now = timestamp_secs();
        let any_restored = self
            .backends
            .iter()
            .any(|b| b.ejected_until != 0 && b.ejected_until <= now);
        if any_restored {
            for b in &mut self.backends {
                if b.ejected_until != 0 && b.ejected_until <= now {
                    b.ejected_until = 0;
                }
            }
            self.rebuild_ring();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ServerSpec};

    fn test_config(failure_limit: u32, auto_eject: bool) -> PoolConfig {
        PoolConfig {
            listen: "0.0.0.0:11211".to_owned(),
            hash: "fnv1a_32".to_owned(),
            distribution: "modula".to_owned(),
            timeout_ms: 400,
            server_failure_limit: failure_limit,
            server_retry_timeout_ms: 30_000,
            server_connections: 1,
            auto_eject_hosts: auto_eject,
            preconnect: false,
            servers: vec![
                ServerSpec { name: Some("s0".into()), address: "127.0.0.1:11212".into(), weight: 1 },
                ServerSpec { name: Some("s1".into()), address: "127.0.0.1:11213".into(), weight: 1 },
            ],
        }
    }

    #[test]
    fn routes_consistently_for_the_same_key() {
        let pool = ServerPool::from_config(&test_config(2, true));
        let a = pool.route(b"foo");
        let b = pool.route(b"foo");
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn ejects_after_failure_limit_and_excludes_from_routing() {
        let mut pool = ServerPool::from_config(&test_config(2, true));

        // Find a key that currently routes to backend 0.
        let key = (0u32..).map(|i| i.to_le_bytes()).find(|k| pool.route(k) == Some(0)).unwrap();

        pool.record_failure(0);
        assert_eq!(pool.route(&key), Some(0)); // one failure: not ejected yet
        pool.record_failure(0);
        assert_ne!(pool.route(&key), Some(0)); // second failure: ejected, rerouted
    }

    #[test]
    fn success_resets_failure_count() {
        let mut pool = ServerPool::from_config(&test_config(2, true));
        pool.record_failure(0);
        pool.record_success(0);
        assert_eq!(pool.backends[0].failure_count, 0);
    }

    #[test]
    fn without_auto_eject_ejected_backends_still_appear_in_routing() {
        let mut pool = ServerPool::from_config(&test_config(1, false));
        let key = (0u32..).map(|i| i.to_le_bytes()).find(|k| pool.route(k) == Some(0)).unwrap();
        pool.record_failure(0);
        assert!(pool.backends[0].is_ejected(timestamp_secs()));
        assert_eq!(pool.route(&key), Some(0));
    }
}
