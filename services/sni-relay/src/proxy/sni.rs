//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! Pure parsing over the bytes returned by the first read on a client
//! connection. Every length field is checked against the bytes that remain
//! before it is used, so a truncated or hostile packet yields a failure
//! result instead of a panic.
//!
//! Layout walked by the parser (offsets from the start of the record):
//!
//! ```text
//! 0       content type (not checked)
//! 1..3    record version
//! 3..5    record length (not checked)
//! 5       handshake type, must be 0x01 (ClientHello)
//! 6..9    handshake length (not checked)
//! 9..11   client version
//! 11..43  random
//! 43      session id length, then session id
//!         cipher suites length (2), cipher suites
//!         compression methods length (1), compression methods
//!         extensions length (2), extensions
//! ```
//!
//! Each extension is `type (2) | length (2) | body`. The server_name body is
//! `list length (2) | name type (1) | name length (2) | name`, and only the
//! first entry of the list is honored.

/// Offset of the handshake type byte.
const HANDSHAKE_TYPE_OFFSET: usize = 5;

/// Handshake type of a ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Offset of the session id length byte.
const SESSION_ID_LEN_OFFSET: usize = 43;

/// Smallest buffer worth walking past the session id.
const MIN_CLIENT_HELLO_LEN: usize = 47;

/// Extension type of server_name.
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Hostname of the first server_name entry, byte-for-byte.
    Found(String),
    /// Handshake type byte is missing or is not ClientHello.
    NotClientHello,
    /// A length field points past the available bytes, or the name is not UTF-8.
    Malformed,
    /// Extension block scanned to the end without a usable server_name.
    NoServerName,
}

impl SniResult {
    /// Collapse the result into the hostname, if any.
    pub fn into_hostname(self) -> Option<String> {
        match self {
            SniResult::Found(hostname) => Some(hostname),
            _ => None,
        }
    }

    /// Short label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SniResult::Found(_) => "found",
            SniResult::NotClientHello => "not_client_hello",
            SniResult::Malformed => "malformed",
            SniResult::NoServerName => "no_server_name",
        }
    }
}

/// Extract the server name from raw ClientHello bytes.
///
/// Returns `None` whenever no hostname can be recovered.
pub fn extract_server_name(data: &[u8]) -> Option<String> {
    parse_server_name(data).into_hostname()
}

/// Parse the server name from raw ClientHello bytes, keeping the failure kind.
pub fn parse_server_name(data: &[u8]) -> SniResult {
    if data.get(HANDSHAKE_TYPE_OFFSET) != Some(&HANDSHAKE_CLIENT_HELLO) {
        return SniResult::NotClientHello;
    }

    if data.len() < MIN_CLIENT_HELLO_LEN {
        return SniResult::Malformed;
    }

    let name = match extensions_block(data).and_then(find_server_name) {
        Ok(Some(name)) => name,
        Ok(None) => return SniResult::NoServerName,
        Err(Malformed) => return SniResult::Malformed,
    };

    if name.is_empty() {
        return SniResult::NoServerName;
    }

    match std::str::from_utf8(name) {
        Ok(hostname) => SniResult::Found(hostname.to_string()),
        Err(_) => SniResult::Malformed,
    }
}

/// Marker for a length field that runs past the buffer.
#[derive(Debug)]
struct Malformed;

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Malformed> {
        if len > self.data.len() {
            return Err(Malformed);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, len: usize) -> Result<(), Malformed> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, Malformed> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Malformed> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// Walk past the fixed header, session id, cipher suites, and compression
/// methods, and return the extension block. The whole block must be present.
fn extensions_block(data: &[u8]) -> Result<&[u8], Malformed> {
    let mut reader = Reader::new(data);
    reader.skip(SESSION_ID_LEN_OFFSET)?;

    let session_id_len = reader.u8()?;
    reader.skip(session_id_len as usize)?;

    let cipher_suites_len = reader.u16()?;
    reader.skip(cipher_suites_len as usize)?;

    let compression_len = reader.u8()?;
    reader.skip(compression_len as usize)?;

    let extensions_len = reader.u16()?;
    reader.take(extensions_len as usize)
}

/// Scan the extension block in order and return the first server name.
fn find_server_name(block: &[u8]) -> Result<Option<&[u8]>, Malformed> {
    let mut extensions = Reader::new(block);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()?;
        let body = extensions.take(ext_len as usize)?;

        if ext_type == EXTENSION_SERVER_NAME {
            let mut list = Reader::new(body);
            let _list_len = list.u16()?;
            let _name_type = list.u8()?;
            let name_len = list.u16()?;
            return list.take(name_len as usize).map(Some);
        }
    }

    Ok(None)
}
