//! The loose-object codec: everything that turns attacker-supplied bytes into
//! a [`GitObject`] checks the SHA-1 content address first.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::untrusted::Untrusted;

/// Hex length of a SHA-1 content address.
pub const OBJECT_ID_LEN: usize = 40;

/// SHA-1 content address of a git object, canonically 40 lowercase hex digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse an id from its hex rendering. Anything other than exactly forty
    /// bytes of `[0-9a-f]` is rejected; uppercase digits are a rejection, not
    /// a normalization.
    pub fn from_hex(input: &str) -> Result<Self> {
        let valid = input.len() == OBJECT_ID_LEN
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(Error::BadObjectId {
                input: input.to_string(),
            });
        }
        Ok(ObjectId(input.to_string()))
    }

    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(input).map_err(|_| Error::BadObjectId {
            input: String::from_utf8_lossy(input).into_owned(),
        })?;
        Self::from_hex(text)
    }

    /// The content address of a raw loose-object byte string.
    pub fn hash(raw: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(raw);
        ObjectId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fan-out split used by the loose-object store: `(directory, filename)`.
    pub fn path_parts(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tag name as it appears in `refs/tags/<name>` and in the remote listing.
/// Only bytes from `[A-Za-z0-9._-]` are allowed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagName(String);

impl TagName {
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() || !input.bytes().all(is_tag_name_byte) {
            return Err(Error::BadTagName {
                input: input.to_string(),
            });
        }
        Ok(TagName(input.to_string()))
    }

    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(input).map_err(|_| Error::BadTagName {
            input: String::from_utf8_lossy(input).into_owned(),
        })?;
        Self::parse(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_tag_name_byte(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Tag,
    Commit,
    Tree,
    Blob,
}

impl ObjectKind {
    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        match input {
            b"tag" => Ok(ObjectKind::Tag),
            b"commit" => Ok(ObjectKind::Commit),
            b"tree" => Ok(ObjectKind::Tree),
            b"blob" => Ok(ObjectKind::Blob),
            other => Err(Error::UnknownObjectKind {
                found: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }

    pub fn from_git2(kind: git2::ObjectType) -> Option<Self> {
        match kind {
            git2::ObjectType::Tag => Some(ObjectKind::Tag),
            git2::ObjectType::Commit => Some(ObjectKind::Commit),
            git2::ObjectType::Tree => Some(ObjectKind::Tree),
            git2::ObjectType::Blob => Some(ObjectKind::Blob),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Tag => "tag",
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified git object. Instances exist only after the raw bytes hashed to
/// the id they were requested under (remote provenance) or after a read from
/// the local object database (trusted provenance).
#[derive(Debug)]
pub struct GitObject {
    id: ObjectId,
    kind: ObjectKind,
    raw: Vec<u8>,
    content_start: usize,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl GitObject {
    /// Verify and parse a raw loose-object byte string received from the
    /// remote. The SHA-1 check comes before any structural parsing; bytes
    /// that do not hash to `id` never make it into a `GitObject`.
    pub fn parse(id: &ObjectId, raw: Untrusted<Vec<u8>>) -> Result<Self> {
        raw.validate(|bytes| {
            let computed = ObjectId::hash(&bytes);
            if &computed != id {
                return Err(Error::ObjectIdMismatch {
                    expected: id.to_string(),
                    computed: computed.to_string(),
                });
            }
            Self::from_verified(id.clone(), bytes)
        })
    }

    /// Rebuild an object from a local object-database read. The local store
    /// is trusted, so there is no hash re-check, but the header bag is still
    /// parsed the same way.
    pub fn from_local(id: ObjectId, kind: ObjectKind, content: &[u8]) -> Result<Self> {
        let mut raw = format!("{} {}\0", kind, content.len()).into_bytes();
        raw.extend_from_slice(content);
        let object = Self::from_verified(id, raw)?;
        if object.kind() != kind {
            return Err(Error::KindMismatch {
                expected: kind,
                actual: object.kind(),
            });
        }
        Ok(object)
    }

    fn from_verified(id: ObjectId, raw: Vec<u8>) -> Result<Self> {
        let nul = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::MalformedObject {
                reason: "no NUL between header and content",
            })?;
        let header = &raw[..nul];
        if header.iter().filter(|&&b| b == b' ').count() != 1 {
            return Err(Error::MalformedObject {
                reason: "header is not `<type> <size>`",
            });
        }
        // Exactly one space, so position() is it.
        let sp = header
            .iter()
            .position(|&b| b == b' ')
            .ok_or(Error::MalformedObject {
                reason: "header is not `<type> <size>`",
            })?;
        let kind = ObjectKind::from_bytes(&header[..sp])?;

        let size_digits = &header[sp + 1..];
        if size_digits.is_empty() || !size_digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::MalformedObject {
                reason: "size is not an unsigned decimal integer",
            });
        }
        let declared = std::str::from_utf8(size_digits)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(Error::MalformedObject {
                reason: "size does not fit in 64 bits",
            })?;

        let content_start = nul + 1;
        let actual = (raw.len() - content_start) as u64;
        if declared != actual {
            return Err(Error::SizeMismatch { declared, actual });
        }

        let headers = parse_headers(kind, &raw[content_start..])?;

        Ok(GitObject {
            id,
            kind,
            raw,
            content_start,
            headers,
        })
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The raw bytes as hashed: `<type> SP <size> NUL <content>`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn content(&self) -> &[u8] {
        &self.raw[self.content_start..]
    }

    pub fn size(&self) -> u64 {
        self.content().len() as u64
    }

    /// Last value of a header key, or `None`. Repeatable headers want
    /// [`GitObject::headers`] instead.
    pub fn header(&self, key: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Every value of a header key, in file order. Commits carry one `parent`
    /// header per parent, and all of them matter.
    pub fn headers<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// A header whose value must be a well-formed object id.
    pub fn header_oid(&self, name: &'static str) -> Result<ObjectId> {
        let value = self
            .header(name.as_bytes())
            .ok_or(Error::MissingHeader { name })?;
        ObjectId::from_bytes(value)
    }
}

fn parse_headers(kind: ObjectKind, content: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if !matches!(kind, ObjectKind::Tag | ObjectKind::Commit) {
        return Ok(Vec::new());
    }

    let mut trimmed = content;
    while let [rest @ .., b'\n'] = trimmed {
        trimmed = rest;
    }
    let head = match find_subsequence(trimmed, b"\n\n") {
        Some(blank) => &trimmed[..blank],
        None => trimmed,
    };

    let mut headers = Vec::new();
    for line in head.split(|&b| b == b'\n') {
        let sp = line
            .iter()
            .position(|&b| b == b' ')
            .ok_or(Error::MalformedObject {
                reason: "header line has no space separator",
            })?;
        headers.push((line[..sp].to_vec(), line[sp + 1..].to_vec()));
    }
    Ok(headers)
}

/// First occurrence of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
