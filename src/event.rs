// src/event.rs
use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Highest timestamp handed out so far in this process.
static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// The kind of mutation a [`ChangeEvent`] describes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    /// Every kind, in wire order.
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete];

    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized record of one filesystem mutation on the origin.
///
/// Events are immutable once built. Both the constructors and deserialization
/// enforce the model invariants:
///
/// - `path` is never empty.
/// - directories carry no body.
/// - `Delete` carries no body.
/// - `Update` only applies to files.
/// - file `Create` and `Update` always carry a body (possibly empty).
///
/// `path` is slash-separated and relative to the replicated root, written with
/// a leading `/` (e.g. `/notes/todo.txt`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "RawChangeEvent", rename_all = "camelCase")]
pub struct ChangeEvent {
    kind: ChangeKind,
    path: String,
    is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none", with = "body_base64")]
    body: Option<Vec<u8>>,
    timestamp: u64,
}

/// Unchecked wire shape of a [`ChangeEvent`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeEvent {
    kind: ChangeKind,
    path: String,
    is_directory: bool,
    #[serde(default, with = "body_base64")]
    body: Option<Vec<u8>>,
    timestamp: u64,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = MirrorError;

    fn try_from(raw: RawChangeEvent) -> Result<Self> {
        validate(raw.kind, &raw.path, raw.is_directory, raw.body.as_deref())?;
        Ok(ChangeEvent {
            kind: raw.kind,
            path: raw.path,
            is_directory: raw.is_directory,
            body: raw.body,
            timestamp: raw.timestamp,
        })
    }
}

/// File content travels as a standard base64 string, so a frame stays close
/// to the size of the file it carries.
mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match body {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn validate(kind: ChangeKind, path: &str, is_directory: bool, body: Option<&[u8]>) -> Result<()> {
    if path.is_empty() {
        return Err(MirrorError::EmptyPath);
    }
    match (kind, is_directory, body.is_some()) {
        (_, true, true) => Err(MirrorError::InvalidEvent(format!(
            "directory event for {} carries a body",
            path
        ))),
        (ChangeKind::Delete, _, true) => Err(MirrorError::InvalidEvent(format!(
            "delete event for {} carries a body",
            path
        ))),
        (ChangeKind::Update, true, _) => Err(MirrorError::InvalidEvent(format!(
            "update event for {} targets a directory",
            path
        ))),
        (ChangeKind::Create | ChangeKind::Update, false, false) => Err(MirrorError::InvalidEvent(
            format!("{} event for file {} has no body", kind, path),
        )),
        _ => Ok(()),
    }
}

/// Milliseconds since the Unix epoch, never lower than a previously returned value.
fn next_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let prev = LAST_TIMESTAMP.fetch_max(now, Ordering::SeqCst);
    prev.max(now)
}

impl ChangeEvent {
    /// Builds a validated event stamped with the current origin time.
    pub fn new(
        kind: ChangeKind,
        path: impl Into<String>,
        is_directory: bool,
        body: Option<Vec<u8>>,
    ) -> Result<Self> {
        let path = path.into();
        validate(kind, &path, is_directory, body.as_deref())?;
        Ok(ChangeEvent {
            kind,
            path,
            is_directory,
            body,
            timestamp: next_timestamp(),
        })
    }

    pub fn create_dir(path: impl Into<String>) -> Result<Self> {
        Self::new(ChangeKind::Create, path, true, None)
    }

    pub fn create_file(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(ChangeKind::Create, path, false, Some(body.into()))
    }

    pub fn update(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(ChangeKind::Update, path, false, Some(body.into()))
    }

    pub fn delete(path: impl Into<String>, is_directory: bool) -> Result<Self> {
        Self::new(ChangeKind::Delete, path, is_directory, None)
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Root-relative, slash-separated path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Origin-side creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}
