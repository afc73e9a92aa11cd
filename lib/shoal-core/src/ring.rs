//! Consistent-hash routing over a live server list. Two distributions are
//! supported: ketama, which keeps relocation minimal when the server list
//! changes, and modula, a plain `hash % len` that is cheap but reshuffles
//! almost everything on any membership change.

use shoal_support::hash::md5_32;

const POINTS_PER_WEIGHT_UNIT: u32 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Ketama,
    Modula,
}

impl Distribution {
    pub fn from_name(name: &str) -> Option<Distribution> {
        match name {
            "ketama" => Some(Distribution::Ketama),
            "modula" => Some(Distribution::Modula),
            _ => None,
        }
    }
}

struct Point {
    hash: u32,
    server: usize,
}

/// A server as seen by the ring: just enough to build ketama points or do a
/// modula lookup. The ring does not own connection state; it only answers
/// "which server index serves this key".
pub struct RingServer {
    pub name: String,
    pub weight: u32,
}

pub struct Ring {
    distribution: Distribution,
    points: Vec<Point>,
    live_count: usize,
}

impl Ring {
    pub fn build(servers: &[RingServer], distribution: Distribution) -> Ring {
        let mut ring = Ring {
            distribution,
            points: Vec::new(),
            live_count: servers.len(),
        };
        ring.rebuild(servers);
        ring
    }

    /// Rebuild the ring from the current set of live servers. Called
    /// whenever the pool's live membership changes (ejection or
    /// restoration) when `auto_eject_hosts` is enabled.
    pub fn rebuild(&mut self, servers: &[RingServer]) {
        self.live_count = servers.len();

        match self.distribution {
            Distribution::Modula => {
                self.points.clear();
            }
            Distribution::Ketama => {
                let mut points = Vec::with_capacity(servers.len() * POINTS_PER_WEIGHT_UNIT as usize);
                for (index, server) in servers.iter().enumerate() {
                    let count = POINTS_PER_WEIGHT_UNIT * server.weight.max(1);
                    for point in 0..count {
                        let key = format!("{}-{}", server.name, point);
                        points.push(Point {
                            hash: md5_32(key.as_bytes()),
                            server: index,
                        });
                    }
                }
                points.sort_by_key(|p| p.hash);
                self.points = points;
            }
        }
    }

    /// Map a key hash to a live server index. Callers supply the hash (so
    /// the pool's configured key-hash function, not necessarily MD5, is
    /// used for lookup, while ketama point generation always uses MD5
    /// internally regardless of that choice).
    pub fn lookup(&self, key_hash: u32) -> Option<usize> {
        if self.live_count == 0 {
            return None;
        }

        match self.distribution {
            Distribution::Modula => Some((key_hash as usize) % self.live_count),
            Distribution::Ketama => {
                if self.points.is_empty() {
                    return None;
                }
                let idx = match self.points.binary_search_by_key(&key_hash, |p| p.hash) {
                    Ok(i) => i,
                    Err(i) => {
                        if i == self.points.len() {
                            0
                        } else {
                            i
                        }
                    }
                };
                Some(self.points[idx].server)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: usize) -> Vec<RingServer> {
        (0..n)
            .map(|i| RingServer {
                name: format!("s{}", i),
                weight: 1,
            })
            .collect()
    }

    #[test]
    fn modula_wraps_to_live_count() {
        let servers = servers(3);
        let ring = Ring::build(&servers, Distribution::Modula);
        assert_eq!(ring.lookup(0), Some(0));
        assert_eq!(ring.lookup(3), Some(0));
        assert_eq!(ring.lookup(4), Some(1));
    }

    #[test]
    fn ketama_lookup_is_deterministic() {
        let servers = servers(4);
        let ring = Ring::build(&servers, Distribution::Ketama);
        let first = ring.lookup(12345);
        let second = ring.lookup(12345);
        assert_eq!(first, second);
        assert!(first.unwrap() < 4);
    }

    #[test]
    fn ketama_empty_ring_has_no_lookup() {
        let ring = Ring::build(&[], Distribution::Ketama);
        assert_eq!(ring.lookup(1), None);
    }

    #[test]
    fn ketama_removing_one_server_relocates_a_minority_of_keys() {
        let full = servers(5);
        let reduced = servers(4);

        let ring_full = Ring::build(&full, Distribution::Ketama);
        let ring_reduced = Ring::build(&reduced, Distribution::Ketama);

        let sample: Vec<u32> = (0..2000).map(|i| i * 2654435761u32).collect();
        let relocated = sample
            .iter()
            .filter(|&&h| {
                let before = ring_full.lookup(h);
                let after = ring_reduced.lookup(h);
                before != after
            })
            .count();

        // Removing one of five servers should move roughly 1/5 of keys, not
        // the near-total reshuffle modula would cause.
        assert!(relocated < sample.len() * 2 / 5);
    }

    #[test]
    fn modula_reshuffles_most_keys_on_membership_change() {
        let full = servers(5);
        let reduced = servers(4);

        let ring_full = Ring::build(&full, Distribution::Modula);
        let ring_reduced = Ring::build(&reduced, Distribution::Modula);

        let sample: Vec<u32> = (0..2000).collect();
        let relocated = sample
            .iter()
            .filter(|&&h| ring_full.lookup(h) != ring_reduced.lookup(h))
            .count();

        assert!(relocated > sample.len() / 2);
    }
}
