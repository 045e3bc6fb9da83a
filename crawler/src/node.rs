//! Crawl targets and the records persisted about them.
//!
//! Everything stored in the shared state is versioned, `|` delimited text. The
//! parsers here return typed errors and never interpret stored data in any
//! other way.

use bitcoin_census_connection::NodeAddress;
use std::fmt;
use std::str::FromStr;

/// Version tag leading every stored record.
const RECORD_VERSION: &str = "1";
/// Separator between record fields.
const FIELD_SEPARATOR: char = '|';
/// Separator between the children of a discovery record.
const CHILD_SEPARATOR: char = ';';
/// Separator between the fields of one child.
const CHILD_FIELD_SEPARATOR: char = ',';
/// Number of fields of an encoded node key, without the version tag.
const KEY_FIELDS: usize = 3;

/// Errors from parsing a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordParseError {
    /// The record is empty.
    Empty,
    /// The version tag is unknown.
    UnsupportedVersion(String),
    /// Wrong number of fields.
    FieldCount { expected: usize, found: usize },
    /// A field does not hold a node address.
    InvalidAddress(String),
    /// A field does not hold a number.
    InvalidNumber(String),
}

impl fmt::Display for RecordParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordParseError::Empty => write!(f, "Empty record"),
            RecordParseError::UnsupportedVersion(version) => {
                write!(f, "Unsupported record version: {version}")
            }
            RecordParseError::FieldCount { expected, found } => {
                write!(f, "Expected {expected} record fields, found {found}")
            }
            RecordParseError::InvalidAddress(field) => write!(f, "Invalid address field: {field}"),
            RecordParseError::InvalidNumber(field) => write!(f, "Invalid number field: {field}"),
        }
    }
}

impl std::error::Error for RecordParseError {}

/// Split a record into its fields after checking the version tag.
fn record_fields(record: &str) -> Result<Vec<&str>, RecordParseError> {
    if record.is_empty() {
        return Err(RecordParseError::Empty);
    }
    let mut fields = record.split(FIELD_SEPARATOR);
    match fields.next() {
        Some(RECORD_VERSION) => Ok(fields.collect()),
        Some(version) => Err(RecordParseError::UnsupportedVersion(version.to_string())),
        None => Err(RecordParseError::Empty),
    }
}

fn parse_number<T: FromStr>(field: &str) -> Result<T, RecordParseError> {
    field
        .parse()
        .map_err(|_| RecordParseError::InvalidNumber(field.to_string()))
}

/// Identity of a crawl target within an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub address: NodeAddress,
    pub port: u16,
    /// Service bits, assumed before the handshake and reported after it.
    pub services: u64,
}

impl NodeKey {
    pub fn new(address: NodeAddress, port: u16, services: u64) -> Self {
        NodeKey {
            address,
            port,
            services,
        }
    }

    /// The same target with different service bits.
    pub fn with_services(&self, services: u64) -> Self {
        NodeKey {
            address: self.address.clone(),
            port: self.port,
            services,
        }
    }

    /// Stored form, `1|<address>|<port>|<services>`.
    pub fn encode(&self) -> String {
        let mut out = String::from(RECORD_VERSION);
        self.write_fields(&mut out, FIELD_SEPARATOR);
        out
    }

    /// Parse the stored form.
    pub fn decode(record: &str) -> Result<Self, RecordParseError> {
        let fields = record_fields(record)?;
        if fields.len() != KEY_FIELDS {
            return Err(RecordParseError::FieldCount {
                expected: KEY_FIELDS,
                found: fields.len(),
            });
        }
        NodeKey::from_fields(&fields)
    }

    fn write_fields(&self, out: &mut String, separator: char) {
        out.push(separator);
        out.push_str(&self.address.to_string());
        out.push(separator);
        out.push_str(&self.port.to_string());
        out.push(separator);
        out.push_str(&self.services.to_string());
    }

    fn from_fields(fields: &[&str]) -> Result<Self, RecordParseError> {
        let [address, port, services] = fields else {
            return Err(RecordParseError::FieldCount {
                expected: KEY_FIELDS,
                found: fields.len(),
            });
        };
        let address = address
            .parse::<NodeAddress>()
            .map_err(|_| RecordParseError::InvalidAddress(address.to_string()))?;
        Ok(NodeKey {
            address,
            port: parse_number(port)?,
            services: parse_number(services)?,
        })
    }

    /// Child form used inside discovery records, `<address>,<port>,<services>`.
    fn encode_child(&self) -> String {
        format!(
            "{}{CHILD_FIELD_SEPARATOR}{}{CHILD_FIELD_SEPARATOR}{}",
            self.address, self.port, self.services
        )
    }

    fn decode_child(child: &str) -> Result<Self, RecordParseError> {
        let fields: Vec<&str> = child.split(CHILD_FIELD_SEPARATOR).collect();
        NodeKey::from_fields(&fields)
    }
}

/// Renders as `<address>-<port>-<services>`, the form used in snapshots.
impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.address, self.port, self.services)
    }
}

/// A queued crawl target.
///
/// The parent, the node which advertised this one, is only carried when
/// duplicate tracking is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub key: NodeKey,
    pub parent: Option<NodeKey>,
}

impl Candidate {
    pub fn new(key: NodeKey) -> Self {
        Candidate { key, parent: None }
    }

    pub fn with_parent(key: NodeKey, parent: NodeKey) -> Self {
        Candidate {
            key,
            parent: Some(parent),
        }
    }

    /// Stored form, the key fields optionally followed by the parent's.
    pub fn encode(&self) -> String {
        let mut out = self.key.encode();
        if let Some(parent) = &self.parent {
            parent.write_fields(&mut out, FIELD_SEPARATOR);
        }
        out
    }

    pub fn decode(record: &str) -> Result<Self, RecordParseError> {
        let fields = record_fields(record)?;
        match fields.len() {
            KEY_FIELDS => Ok(Candidate::new(NodeKey::from_fields(&fields)?)),
            n if n == KEY_FIELDS * 2 => Ok(Candidate::with_parent(
                NodeKey::from_fields(&fields[..KEY_FIELDS])?,
                NodeKey::from_fields(&fields[KEY_FIELDS..])?,
            )),
            found => Err(RecordParseError::FieldCount {
                expected: KEY_FIELDS,
                found,
            }),
        }
    }
}

impl From<NodeKey> for Candidate {
    fn from(key: NodeKey) -> Self {
        Candidate::new(key)
    }
}

/// What one reachable node advertised during an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub parent: NodeKey,
    /// Number of admitted peers, `-1` when the node never answered `getaddr`.
    pub count: i64,
    pub children: Vec<NodeKey>,
}

impl DiscoveryRecord {
    /// Stored form, `1|<parent fields>|<count>|<child>;<child>...`.
    pub fn encode(&self) -> String {
        let mut out = self.parent.encode();
        out.push(FIELD_SEPARATOR);
        out.push_str(&self.count.to_string());
        out.push(FIELD_SEPARATOR);
        let children: Vec<String> = self.children.iter().map(NodeKey::encode_child).collect();
        out.push_str(&children.join(&CHILD_SEPARATOR.to_string()));
        out
    }

    pub fn decode(record: &str) -> Result<Self, RecordParseError> {
        let fields = record_fields(record)?;
        if fields.len() != KEY_FIELDS + 2 {
            return Err(RecordParseError::FieldCount {
                expected: KEY_FIELDS + 2,
                found: fields.len(),
            });
        }

        let parent = NodeKey::from_fields(&fields[..KEY_FIELDS])?;
        let count = parse_number(fields[KEY_FIELDS])?;
        let children = match fields[KEY_FIELDS + 1] {
            "" => Vec::new(),
            children => children
                .split(CHILD_SEPARATOR)
                .map(NodeKey::decode_child)
                .collect::<Result<_, _>>()?,
        };

        Ok(DiscoveryRecord {
            parent,
            count,
            children,
        })
    }
}
