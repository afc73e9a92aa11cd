//! Streaming memcached ASCII parser. Operates directly on a `Chain`,
//! scanning ahead with `byte_at` before committing to a `consume`, so a
//! partial message in the chain never loses bytes on a failed parse
//! attempt — the caller simply waits for more input and retries from the
//! same chain state.
//!
//! Key and short header fields are copied out (they are bounded at 250
//! bytes and cheap); the value payload for storage commands and the value
//! blocks of a get/gets response are referenced by offset and length into
//! the chain instead, so the bulk of the bytes that matter for zero-copy
//! forwarding are never duplicated.

use crate::chain::Chain;

pub const MAX_KEY_LENGTH: usize = 250;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const SP: u8 = b' ';

fn is_key_byte(b: u8) -> bool {
    !matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0u8 | 0x0b | 0x0c)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    Gets,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Delete,
    Incr,
    Decr,
    Touch,
    Quit,
    Version,
    Stats,
}

impl Command {
    fn from_word(word: &[u8]) -> Option<Command> {
        Some(match word {
            b"get" => Command::Get,
            b"gets" => Command::Gets,
            b"set" => Command::Set,
            b"add" => Command::Add,
            b"replace" => Command::Replace,
            b"append" => Command::Append,
            b"prepend" => Command::Prepend,
            b"cas" => Command::Cas,
            b"delete" => Command::Delete,
            b"incr" => Command::Incr,
            b"decr" => Command::Decr,
            b"touch" => Command::Touch,
            b"quit" => Command::Quit,
            b"version" => Command::Version,
            b"stats" => Command::Stats,
            _ => return None,
        })
    }

    pub fn is_storage(self) -> bool {
        matches!(
            self,
            Command::Set
                | Command::Add
                | Command::Replace
                | Command::Append
                | Command::Prepend
                | Command::Cas
        )
    }

    pub fn is_retrieval(self) -> bool {
        matches!(self, Command::Get | Command::Gets)
    }
}

/// A fully parsed request. `data_offset`/`data_len` describe the storage
/// payload's position within the chain that was parsed, valid only until
/// the caller consumes bytes from that chain.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub command: Command,
    pub keys: Vec<Vec<u8>>,
    pub flags: u32,
    pub exptime: u32,
    pub vlen: usize,
    pub cas_unique: Option<u64>,
    pub noreply: bool,
    pub data_offset: usize,
    pub data_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    /// A complete message was recognized; `usize` is the number of bytes
    /// the caller should `consume` from the chain.
    Complete(T, usize),
    /// Valid partial prefix; wait for more bytes before retrying.
    Again,
    /// Input is malformed per the grammar.
    Error(&'static str),
}

struct Scanner<'a> {
    chain: &'a Chain,
    pos: usize,
    len: usize,
}

impl<'a> Scanner<'a> {
    fn new(chain: &'a Chain) -> Scanner<'a> {
        Scanner { chain, pos: 0, len: chain.len() }
    }

    fn peek(&self) -> Option<u8> {
        self.chain.byte_at(self.pos)
    }

    fn at(&self, offset: usize) -> Option<u8> {
        self.chain.byte_at(self.pos + offset)
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn remaining(&self) -> usize {
        self.len.saturating_sub(self.pos)
    }

    /// Find the next CRLF at or after the current position, relative to it.
    /// Returns the offset of the CR byte.
    fn find_crlf(&self) -> Option<usize> {
        let mut i = self.pos;
        while i + 1 < self.len {
            if self.chain.byte_at(i) == Some(CR) && self.chain.byte_at(i + 1) == Some(LF) {
                return Some(i - self.pos);
            }
            i += 1;
        }
        None
    }

    fn copy(&self, at: usize, count: usize) -> Vec<u8> {
        self.chain.copy_range(self.pos + at, count)
    }
}

/// Parse one request starting at the current head of `chain`. Does not
/// mutate the chain; the caller consumes `Complete(_, n)` bytes on success.
pub fn parse_request(chain: &Chain) -> ParseOutcome<ParsedRequest> {
    let mut s = Scanner::new(chain);

    let line_end = match s.find_crlf() {
        Some(offset) => offset,
        None => {
            // Unbounded scans are bounded by MAX_KEY_LENGTH plus a small
            // header allowance; beyond that with no CRLF the line itself is
            // malformed rather than merely incomplete.
            if s.remaining() > MAX_KEY_LENGTH * 8 + 128 {
                return ParseOutcome::Error("request header line too long");
            }
            return ParseOutcome::Again;
        }
    };

    let line = s.copy(0, line_end);
    let mut words = line.split(|&b| b == SP).filter(|w| !w.is_empty());

    let command_word = match words.next() {
        Some(w) => w,
        None => return ParseOutcome::Error("empty request line"),
    };

    let command = match Command::from_word(command_word) {
        Some(c) => c,
        None => return ParseOutcome::Error("unknown command"),
    };

    match command {
        Command::Quit | Command::Version => {
            ParseOutcome::Complete(
                ParsedRequest {
                    command,
                    keys: Vec::new(),
                    flags: 0,
                    exptime: 0,
                    vlen: 0,
                    cas_unique: None,
                    noreply: false,
                    data_offset: 0,
                    data_len: 0,
                },
                line_end + 2,
            )
        }
        Command::Stats => {
            ParseOutcome::Complete(
                ParsedRequest {
                    command,
                    keys: Vec::new(),
                    flags: 0,
                    exptime: 0,
                    vlen: 0,
                    cas_unique: None,
                    noreply: false,
                    data_offset: 0,
                    data_len: 0,
                },
                line_end + 2,
            )
        }
        Command::Get | Command::Gets => {
            let keys: Vec<Vec<u8>> = words.map(|w| w.to_vec()).collect();
            if keys.is_empty() {
                return ParseOutcome::Error("get requires at least one key");
            }
            for key in &keys {
                if let Err(reason) = validate_key(key) {
                    return ParseOutcome::Error(reason);
                }
            }
            ParseOutcome::Complete(
                ParsedRequest {
                    command,
                    keys,
                    flags: 0,
                    exptime: 0,
                    vlen: 0,
                    cas_unique: None,
                    noreply: false,
                    data_offset: 0,
                    data_len: 0,
                },
                line_end + 2,
            )
        }
        Command::Delete => {
            let key = match words.next() {
                Some(w) => w.to_vec(),
                None => return ParseOutcome::Error("delete requires a key"),
            };
            if let Err(reason) = validate_key(&key) {
                return ParseOutcome::Error(reason);
            }
            let noreply = words.next() == Some(b"noreply".as_ref());
            ParseOutcome::Complete(
                ParsedRequest {
                    command,
                    keys: vec![key],
                    flags: 0,
                    exptime: 0,
                    vlen: 0,
                    cas_unique: None,
                    noreply,
                    data_offset: 0,
                    data_len: 0,
                },
                line_end + 2,
            )
        }
        Command::Incr | Command::Decr | Command::Touch => {
            let key = match words.next() {
                Some(w) => w.to_vec(),
                None => return ParseOutcome::Error("command requires a key"),
            };
            if let Err(reason) = validate_key(&key) {
                return ParseOutcome::Error(reason);
            }
            let _arg = match words.next() {
                Some(w) => w,
                None => return ParseOutcome::Error("command requires a numeric argument"),
            };
            let noreply = words.next() == Some(b"noreply".as_ref());
            ParseOutcome::Complete(
                ParsedRequest {
                    command,
                    keys: vec![key],
                    flags: 0,
                    exptime: 0,
                    vlen: 0,
                    cas_unique: None,
                    noreply,
                    data_offset: 0,
                    data_len: 0,
                },
                line_end + 2,
            )
        }
        _ => parse_storage_command(command, &mut s, line_end, words),
    }
}

fn parse_storage_command<'a, 'b>(
    command: Command,
    s: &mut Scanner<'a>,
    line_end: usize,
    mut words: impl Iterator<Item = &'b [u8]>,
) -> ParseOutcome<ParsedRequest> {
    let key = match words.next() {
        Some(w) => w.to_vec(),
        None => return ParseOutcome::Error("storage command requires a key"),
    };
    if let Err(reason) = validate_key(&key) {
        return ParseOutcome::Error(reason);
    }

    let flags = match words.next().and_then(parse_u32) {
        Some(v) => v,
        None => return ParseOutcome::Error("invalid flags"),
    };
    let exptime = match words.next().and_then(parse_u32) {
        Some(v) => v,
        None => return ParseOutcome::Error("invalid exptime"),
    };
    let vlen = match words.next().and_then(parse_usize) {
        Some(v) => v,
        None => return ParseOutcome::Error("invalid byte count"),
    };

    let cas_unique = if command == Command::Cas {
        match words.next().and_then(parse_u64) {
            Some(v) => Some(v),
            None => return ParseOutcome::Error("cas requires a unique value"),
        }
    } else {
        None
    };

    let noreply = words.next() == Some(b"noreply".as_ref());

    let header_len = line_end + 2;
    let data_offset = s.pos + header_len;
    let needed = header_len + vlen + 2;

    if s.remaining() < needed {
        return ParseOutcome::Again;
    }

    if s.chain.byte_at(data_offset + vlen) != Some(CR)
        || s.chain.byte_at(data_offset + vlen + 1) != Some(LF)
    {
        return ParseOutcome::Error("data block missing trailing CRLF");
    }

    ParseOutcome::Complete(
        ParsedRequest {
            command,
            keys: vec![key],
            flags,
            exptime,
            vlen,
            cas_unique,
            noreply,
            data_offset,
            data_len: vlen,
        },
        needed,
    )
}

pub fn validate_key(key: &[u8]) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key must not be empty");
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err("key too long");
    }
    if !key.iter().all(|&b| is_key_byte(b)) {
        return Err("key contains an invalid character");
    }
    Ok(())
}

fn parse_u32(word: &[u8]) -> Option<u32> {
    std::str::from_utf8(word).ok()?.parse().ok()
}

fn parse_u64(word: &[u8]) -> Option<u64> {
    std::str::from_utf8(word).ok()?.parse().ok()
}

fn parse_usize(word: &[u8]) -> Option<usize> {
    std::str::from_utf8(word).ok()?.parse().ok()
}

/// One `VALUE` entry inside a get/gets response. `data_offset`/`data_len`
/// reference the chain the response was parsed from.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub key: Vec<u8>,
    pub flags: u32,
    pub cas: Option<u64>,
    pub data_offset: usize,
    pub data_len: usize,
}

#[derive(Debug, Clone)]
pub enum ParsedResponse {
    /// A single status/line reply: STORED, DELETED, NOT_FOUND, a numeric
    /// incr/decr reply, ERROR, CLIENT_ERROR, SERVER_ERROR, a VERSION line,
    /// or a stats line. Carries its own raw bytes for verbatim forwarding.
    Line(Vec<u8>),
    /// Zero or more `VALUE` blocks terminated by `END\r\n`, as produced by
    /// get/gets.
    Values(Vec<ValueEntry>),
}

/// Parse one response starting at the head of `chain`.
pub fn parse_response(chain: &Chain) -> ParseOutcome<ParsedResponse> {
    let mut s = Scanner::new(chain);

    let line_end = match s.find_crlf() {
        Some(offset) => offset,
        None => {
            if s.remaining() > 4096 {
                return ParseOutcome::Error("response line too long");
            }
            return ParseOutcome::Again;
        }
    };

    let line = s.copy(0, line_end);

    if line.starts_with(b"VALUE ") {
        parse_value_blocks(chain)
    } else {
        ParseOutcome::Complete(ParsedResponse::Line(line), line_end + 2)
    }
}

fn parse_value_blocks(chain: &Chain) -> ParseOutcome<ParsedResponse> {
    let mut s = Scanner::new(chain);
    let mut entries = Vec::new();

    loop {
        let line_end = match s.find_crlf() {
            Some(offset) => offset,
            None => return ParseOutcome::Again,
        };
        let line = s.copy(0, line_end);

        if line == b"END" {
            s.advance(line_end + 2);
            return ParseOutcome::Complete(ParsedResponse::Values(entries), s.pos);
        }

        if !line.starts_with(b"VALUE ") {
            return ParseOutcome::Error("expected VALUE or END");
        }

        let mut words = line[6..].split(|&b| b == SP).filter(|w| !w.is_empty());
        let key = match words.next() {
            Some(w) => w.to_vec(),
            None => return ParseOutcome::Error("VALUE missing key"),
        };
        let flags = match words.next().and_then(parse_u32) {
            Some(v) => v,
            None => return ParseOutcome::Error("VALUE missing flags"),
        };
        let vlen = match words.next().and_then(parse_usize) {
            Some(v) => v,
            None => return ParseOutcome::Error("VALUE missing length"),
        };
        let cas = words.next().and_then(parse_u64);

        let header_len = line_end + 2;
        let data_offset = s.pos + header_len;

        if s.remaining() < header_len + vlen + 2 {
            return ParseOutcome::Again;
        }
        if s.chain.byte_at(data_offset + vlen) != Some(CR)
            || s.chain.byte_at(data_offset + vlen + 1) != Some(LF)
        {
            return ParseOutcome::Error("VALUE data missing trailing CRLF");
        }

        entries.push(ValueEntry {
            key,
            flags,
            cas,
            data_offset,
            data_len: vlen,
        });

        s.advance(header_len + vlen + 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbuf::ChunkPool;

    fn chain_with(bytes: &[u8]) -> (Chain, ChunkPool) {
        let mut pool = ChunkPool::new(64);
        let mut chain = Chain::new(&mut pool);
        chain.push(bytes, &mut pool);
        (chain, pool)
    }

    #[test]
    fn parses_simple_get() {
        let (chain, _pool) = chain_with(b"get foo\r\n");
        match parse_request(&chain) {
            ParseOutcome::Complete(req, n) => {
                assert_eq!(req.command, Command::Get);
                assert_eq!(req.keys, vec![b"foo".to_vec()]);
                assert_eq!(n, 9);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn parses_multi_key_get() {
        let (chain, _pool) = chain_with(b"get a b c\r\n");
        match parse_request(&chain) {
            ParseOutcome::Complete(req, _) => {
                assert_eq!(req.keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_header_returns_again() {
        let (chain, _pool) = chain_with(b"get fo");
        assert_eq!(parse_request(&chain), ParseOutcome::Again);
    }

    #[test]
    fn parses_set_with_payload() {
        let (chain, _pool) = chain_with(b"set k 0 0 5\r\nhello\r\n");
        match parse_request(&chain) {
            ParseOutcome::Complete(req, n) => {
                assert_eq!(req.command, Command::Set);
                assert_eq!(req.vlen, 5);
                assert_eq!(chain.copy_range(req.data_offset, req.data_len), b"hello".to_vec());
                assert_eq!(n, 21);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn set_waits_for_full_payload() {
        let (chain, _pool) = chain_with(b"set k 0 0 5\r\nhel");
        assert_eq!(parse_request(&chain), ParseOutcome::Again);
    }

    #[test]
    fn set_missing_trailing_crlf_is_an_error() {
        let (chain, _pool) = chain_with(b"set k 0 0 5\r\nhelloXX");
        match parse_request(&chain) {
            ParseOutcome::Error(_) => {}
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn key_too_long_is_rejected() {
        let long_key = vec![b'a'; MAX_KEY_LENGTH + 1];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&long_key);
        line.extend_from_slice(b"\r\n");
        let (chain, _pool) = chain_with(&line);

        match parse_request(&chain) {
            ParseOutcome::Error(reason) => assert_eq!(reason, "key too long"),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_an_error() {
        let (chain, _pool) = chain_with(b"bogus foo\r\n");
        match parse_request(&chain) {
            ParseOutcome::Error(_) => {}
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn parses_cas_with_unique_value() {
        let (chain, _pool) = chain_with(b"cas k 0 0 3 42\r\nabc\r\n");
        match parse_request(&chain) {
            ParseOutcome::Complete(req, _) => {
                assert_eq!(req.cas_unique, Some(42));
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn parses_stored_response_line() {
        let (chain, _pool) = chain_with(b"STORED\r\n");
        match parse_response(&chain) {
            ParseOutcome::Complete(ParsedResponse::Line(line), n) => {
                assert_eq!(line, b"STORED".to_vec());
                assert_eq!(n, 8);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn parses_single_value_response() {
        let (chain, _pool) = chain_with(b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
        match parse_response(&chain) {
            ParseOutcome::Complete(ParsedResponse::Values(entries), n) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].key, b"foo".to_vec());
                assert_eq!(chain.copy_range(entries[0].data_offset, entries[0].data_len), b"bar".to_vec());
                assert_eq!(n, 26);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn parses_multi_value_response() {
        let (chain, _pool) = chain_with(b"VALUE a 0 1\r\nA\r\nVALUE b 0 1\r\nB\r\nEND\r\n");
        match parse_response(&chain) {
            ParseOutcome::Complete(ParsedResponse::Values(entries), _) => {
                assert_eq!(entries.len(), 2);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn value_response_waits_for_end() {
        let (chain, _pool) = chain_with(b"VALUE a 0 1\r\nA\r\n");
        assert_eq!(parse_response(&chain), ParseOutcome::Again);
    }
}
