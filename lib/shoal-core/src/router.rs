//! Pure routing decisions: which backend(s) a request's keys belong to,
//! how to synthesize a per-backend command line for a fragment, and how to
//! reassemble fragment responses into one client-facing reply. None of
//! this touches sockets or the event loop; `Context` drives those and
//! calls into here for the decisions.

use crate::message::CollectedValue;
use crate::parse::Command;
use crate::pool::ServerPool;

/// Group `keys` by the backend each one routes to, preserving the order in
/// which backends are first seen. A single-backend result means the
/// request can be forwarded verbatim; more than one means it must be
/// fragmented.
pub fn plan_fanout(pool: &ServerPool, keys: &[Vec<u8>]) -> Result<Vec<(usize, Vec<Vec<u8>>)>, &'static str> {
    let mut groups: Vec<(usize, Vec<Vec<u8>>)> = Vec::new();

    for key in keys {
        let backend = pool.route(key).ok_or("no server available")?;
        match groups.iter_mut().find(|(b, _)| *b == backend) {
            Some((_, group_keys)) => group_keys.push(key.clone()),
            None => groups.push((backend, vec![key.clone()])),
        }
    }

    Ok(groups)
}

/// Build the command line to send to a single backend for a (possibly
/// fragmented) get/gets request restricted to `keys`.
pub fn synthesize_request_line(command: Command, keys: &[Vec<u8>]) -> Vec<u8> {
    let verb: &[u8] = match command {
        Command::Get => b"get",
        Command::Gets => b"gets",
        _ => unreachable!("synthesize_request_line is only used for retrieval commands"),
    };

    let mut line = verb.to_vec();
    for key in keys {
        line.push(b' ');
        line.extend_from_slice(key);
    }
    line.extend_from_slice(b"\r\n");
    line
}

/// Merge the values collected from every fragment of a get/gets request
/// into one client-facing byte stream, in the order the original request
/// listed its keys, followed by a single `END\r\n`. Keys that no fragment
/// returned a value for (miss, or the fragment's backend failed) are
/// simply omitted, matching memcached's own behavior for a miss.
pub fn reassemble_values(requested_keys: &[Vec<u8>], values: &[CollectedValue]) -> Vec<u8> {
    let mut out = Vec::new();

    for key in requested_keys {
        if let Some(entry) = values.iter().find(|v| &v.key == key) {
            out.extend_from_slice(b"VALUE ");
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(format!(" {}", entry.flags).as_bytes());
            out.extend_from_slice(format!(" {}", entry.data.len()).as_bytes());
            if let Some(cas) = entry.cas {
                out.extend_from_slice(format!(" {}", cas).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&entry.data);
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"END\r\n");
    out
}
