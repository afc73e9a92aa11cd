//! The message slab. Requests and responses are identified by an opaque id
//! rather than passed around by reference, so the same logical request can
//! sit simultaneously on a client's in-flight queue and on one or more
//! server connections' forwarded queues without aliasing a borrow.

use crate::parse::{Command, ParsedRequest};
use hashbrown::HashMap;

pub type MessageId = u64;
pub type ConnId = u64;

/// A single outstanding request, possibly split into fragments routed to
/// different backends.
pub struct Message {
    pub id: MessageId,
    pub client: ConnId,
    pub command: Command,
    pub keys: Vec<Vec<u8>>,
    pub noreply: bool,
    /// Fragment ids dispatched for this message, one per backend involved.
    /// A non-fragmented message has exactly one entry, which is its own id.
    pub fragments: Vec<MessageId>,
    /// Count of fragments not yet resolved (responded or failed).
    pub outstanding: usize,
    /// Raw response bytes collected so far for a single-line (non-
    /// retrieval) reply; a retrieval command's results accumulate in
    /// `values` instead, since they must be re-merged with exactly one
    /// trailing `END` regardless of how many backends contributed.
    pub collected: Vec<u8>,
    /// Values collected from retrieval fragments, unordered; reassembled
    /// in the original request's key order once `outstanding` reaches
    /// zero.
    pub values: Vec<CollectedValue>,
    /// Set once any fragment failed; distinguishes a deadline expiry from a
    /// backend I/O failure since the two surface different `SERVER_ERROR`
    /// text to the client.
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    BackendError,
}

/// One fragment of a (possibly split) request, forwarded to a single
/// server connection.
pub struct Fragment {
    pub id: MessageId,
    pub parent: MessageId,
    pub server: ConnId,
    pub keys: Vec<Vec<u8>>,
}

/// A single key's value as returned by one backend fragment of a get/gets
/// request, with its bytes already copied out of that fragment's server
/// connection before the connection's input chain consumes past them.
#[derive(Debug, Clone)]
pub struct CollectedValue {
    pub key: Vec<u8>,
    pub flags: u32,
    pub cas: Option<u64>,
    pub data: Vec<u8>,
}

pub struct MessageSlab {
    next_id: MessageId,
    messages: HashMap<MessageId, Message>,
    fragments: HashMap<MessageId, Fragment>,
}

impl MessageSlab {
    pub fn new() -> MessageSlab {
        MessageSlab {
            next_id: 1,
            messages: HashMap::new(),
            fragments: HashMap::new(),
        }
    }

    fn alloc_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a freshly parsed client request as a pending message with
    /// no fragments yet; the router attaches fragments next via
    /// `attach_fragment`.
    pub fn begin(&mut self, client: ConnId, parsed: &ParsedRequest) -> MessageId {
        let id = self.alloc_id();
        self.messages.insert(
            id,
            Message {
                id,
                client,
                command: parsed.command,
                keys: parsed.keys.clone(),
                noreply: parsed.noreply,
                fragments: Vec::new(),
                outstanding: 0,
                collected: Vec::new(),
                values: Vec::new(),
                failure: None,
            },
        );
        id
    }

    /// Attach a new fragment bound for `server`, carrying `keys`, to an
    /// existing pending message.
    pub fn attach_fragment(&mut self, parent: MessageId, server: ConnId, keys: Vec<Vec<u8>>) -> MessageId {
        let id = self.alloc_id();
        self.fragments.insert(
            id,
            Fragment {
                id,
                parent,
                server,
                keys,
            },
        );
        if let Some(message) = self.messages.get_mut(&parent) {
            message.fragments.push(id);
            message.outstanding += 1;
        }
        id
    }

    pub fn fragment(&self, id: MessageId) -> Option<&Fragment> {
        self.fragments.get(&id)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.get_mut(&id)
    }

    /// Record a fragment's response bytes and decrement its parent's
    /// outstanding count. Returns `true` if the parent is now complete.
    pub fn resolve_fragment(&mut self, fragment_id: MessageId, response: &[u8]) -> Option<bool> {
        let parent_id = self.fragments.remove(&fragment_id)?.parent;
        let message = self.messages.get_mut(&parent_id)?;
        message.collected.extend_from_slice(response);
        message.outstanding = message.outstanding.saturating_sub(1);
        Some(message.outstanding == 0)
    }

    /// Record a retrieval fragment's collected values and decrement its
    /// parent's outstanding count. Returns `true` if the parent is now
    /// complete.
    pub fn resolve_value_fragment(&mut self, fragment_id: MessageId, values: Vec<CollectedValue>) -> Option<bool> {
        let parent_id = self.fragments.remove(&fragment_id)?.parent;
        let message = self.messages.get_mut(&parent_id)?;
        message.values.extend(values);
        message.outstanding = message.outstanding.saturating_sub(1);
        Some(message.outstanding == 0)
    }

    /// Mark a fragment as failed (backend error or timeout); its parent is
    /// flagged failed but still completes once every fragment resolves.
    pub fn fail_fragment(&mut self, fragment_id: MessageId, reason: FailureKind) -> Option<bool> {
        let parent_id = self.fragments.remove(&fragment_id)?.parent;
        let message = self.messages.get_mut(&parent_id)?;
        message.failure.get_or_insert(reason);
        message.outstanding = message.outstanding.saturating_sub(1);
        Some(message.outstanding == 0)
    }

    /// Remove and return a completed message, releasing its slab slot.
    pub fn take(&mut self, id: MessageId) -> Option<Message> {
        self.messages.remove(&id)
    }

    /// Fail and remove every fragment forwarded to `server`, returning the
    /// parent ids that became complete as a result (used when a server
    /// connection dies with outstanding work on it).
    pub fn fail_all_for_server(&mut self, server: ConnId) -> Vec<MessageId> {
        let dead: Vec<MessageId> = self
            .fragments
            .iter()
            .filter(|(_, frag)| frag.server == server)
            .map(|(id, _)| *id)
            .collect();

        let mut completed = Vec::new();
        for id in dead {
            if let Some(Fragment { parent, .. }) = self.fragments.remove(&id) {
                if let Some(message) = self.messages.get_mut(&parent) {
                    message.failure.get_or_insert(FailureKind::BackendError);
                    message.outstanding = message.outstanding.saturating_sub(1);
                    if message.outstanding == 0 {
                        completed.push(parent);
                    }
                }
            }
        }
        completed
    }

    pub fn pending_for_client(&self, client: ConnId) -> usize {
        self.messages.values().filter(|m| m.client == client).count()
    }

    /// Count of messages still awaiting at least one fragment response,
    /// across every client.
    pub fn pending_count(&self) -> usize {
        self.messages.len()
    }
}

impl Default for MessageSlab {
    fn default() -> MessageSlab {
        MessageSlab::new()
    }
}
