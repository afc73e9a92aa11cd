//! A read-only snapshot of pool/server/connection state, for the
//! out-of-scope stats exporter and for tests. Never mutates anything it
//! walks.

use crate::pool::ServerPool;
use shoal_support::time::timestamp_secs;

#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub name: String,
    pub address: String,
    pub failure_count: u32,
    pub ejected: bool,
    pub ejected_remaining_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub client_connections: usize,
    pub server_connections: usize,
    pub in_flight_messages: usize,
    pub backends: Vec<BackendSnapshot>,
}

pub fn snapshot(
    pool: &ServerPool,
    client_connections: usize,
    server_connections: usize,
    in_flight_messages: usize,
) -> PoolSnapshot {
    let now = timestamp_secs();
    let backends = pool
        .backends
        .iter()
        .map(|b| BackendSnapshot {
            name: b.name.clone(),
            address: b.address.to_string(),
            failure_count: b.failure_count,
            ejected: b.is_ejected(now),
            ejected_remaining_secs: b.ejected_until.saturating_sub(now),
        })
        .collect();

    PoolSnapshot {
        client_connections,
        server_connections,
        in_flight_messages,
        backends,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ServerSpec};

    #[test]
    fn snapshot_reports_ejected_backends() {
        let config = PoolConfig {
            listen: "0.0.0.0:11211".to_owned(),
            hash: "fnv1a_32".to_owned(),
            distribution: "ketama".to_owned(),
            timeout_ms: 400,
            server_failure_limit: 1,
            server_retry_timeout_ms: 30_000,
            server_connections: 1,
            auto_eject_hosts: true,
            preconnect: false,
            servers: vec![ServerSpec {
                name: Some("s0".into()),
                address: "127.0.0.1:11212".into(),
                weight: 1,
            }],
        };
        let mut pool = ServerPool::from_config(&config);
        pool.record_failure(0);

        let snap = snapshot(&pool, 3, 1, 2);
        assert_eq!(snap.client_connections, 3);
        assert!(snap.backends[0].ejected);
    }
}
