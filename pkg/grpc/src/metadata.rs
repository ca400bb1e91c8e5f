use base64::engine::{DecodePaddingMode, Engine, GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;

/// Base64 variant used for '-bin' metadata values: standard alphabet, no
/// padding on encode, padding optional on decode (peers differ on this).
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Suffix marking a metadata key whose values are raw bytes (base64 encoded
/// on the wire).
pub const BINARY_KEY_SUFFIX: &str = "-bin";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),

    #[error("invalid ascii metadata value for key {0:?}")]
    InvalidValue(String),

    #[error("invalid base64 in binary metadata value for key {0:?}")]
    InvalidBase64(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }
}

/// Per-call key/value metadata carried in initial headers and trailers.
///
/// This is an ordered multimap: insertion order is preserved on the wire and
/// duplicate keys are allowed. Keys are restricted to lowercase
/// '[a-z0-9._-]+'. Keys ending in '-bin' carry arbitrary bytes; all other
/// keys carry visible ASCII plus space.
///
/// Not internally synchronized. Ownership passes to the transport when a
/// call sends it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

/// Returns whether 'key' is usable as a metadata key. A single leading ':'
/// is tolerated so that parsed pseudo-headers can be represented before
/// they are filtered out.
pub fn is_valid_key(key: &str) -> bool {
    let key = key.strip_prefix(':').unwrap_or(key);
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_' || b == b'-')
}

pub fn is_binary_key(key: &str) -> bool {
    key.ends_with(BINARY_KEY_SUFFIX)
}

fn is_valid_ascii_value(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ASCII value. Fails on invalid keys, on values outside
    /// visible-ASCII-plus-space, and on '-bin' keys (which must use
    /// add_binary).
    pub fn add_ascii<K: AsRef<str>, V: Into<String>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<(), MetadataError> {
        let key = key.as_ref();
        if !is_valid_key(key) || is_binary_key(key) {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        let value = value.into();
        if !is_valid_ascii_value(&value) {
            return Err(MetadataError::InvalidValue(key.to_string()));
        }
        self.entries
            .push((key.to_string(), MetadataValue::Ascii(value)));
        Ok(())
    }

    /// Appends a binary value. The key must end in '-bin'.
    pub fn add_binary<K: AsRef<str>, V: Into<Bytes>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<(), MetadataError> {
        let key = key.as_ref();
        if !is_valid_key(key) || !is_binary_key(key) {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        self.entries
            .push((key.to_string(), MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// First value for the key, if any.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// First value for the key as a string (None for binary values).
    pub fn get_ascii(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Removes every value associated with the key, returning them in order.
    pub fn remove_all(&mut self, key: &str) -> Vec<MetadataValue> {
        let mut removed = Vec::new();
        self.entries.retain(|(k, v)| {
            if k == key {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends all entries of 'other' after the existing entries.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    /// Serializes to wire header fields. Binary values are base64 encoded;
    /// ASCII values pass through.
    pub fn serialize(&self) -> Vec<(String, Bytes)> {
        self.entries
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    MetadataValue::Ascii(s) => Bytes::from(s.clone().into_bytes()),
                    MetadataValue::Binary(b) => Bytes::from(BASE64.encode(b).into_bytes()),
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Parses wire header fields back into metadata.
    ///
    /// Pseudo-headers (keys starting with ':') are skipped: both endpoints
    /// consume them at the transport layer and they never surface as call
    /// metadata. Keys that don't match the metadata grammar are rejected.
    pub fn parse<'a, I>(fields: I) -> Result<Metadata, MetadataError>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut metadata = Metadata::new();
        for (key, value) in fields {
            if key.starts_with(':') {
                continue;
            }
            if !is_valid_key(key) {
                return Err(MetadataError::InvalidKey(key.to_string()));
            }
            if is_binary_key(key) {
                let value = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| BASE64.decode(s).ok())
                    .ok_or_else(|| MetadataError::InvalidBase64(key.to_string()))?;
                metadata
                    .entries
                    .push((key.to_string(), MetadataValue::Binary(value.into())));
            } else {
                let value = std::str::from_utf8(value)
                    .ok()
                    .filter(|s| is_valid_ascii_value(s))
                    .ok_or_else(|| MetadataError::InvalidValue(key.to_string()))?
                    .to_string();
                metadata
                    .entries
                    .push((key.to_string(), MetadataValue::Ascii(value)));
            }
        }
        Ok(metadata)
    }
}
