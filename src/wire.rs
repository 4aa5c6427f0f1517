//! Wire format between the origin and its peers.
//!
//! Each message is a 4-byte big-endian length followed by a JSON document:
//!
//! ```text
//! {"type":"create","payload":{"kind":"create","path":"/notes/todo.txt",...}}
//! {"type":"heartbeat"}
//! ```
//!
//! Traffic only flows origin → peer.

use crate::error::{MirrorError, Result};
use crate::event::{ChangeEvent, ChangeKind};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will write or accept.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One message on the replication stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Frame {
    Create(ChangeEvent),
    Update(ChangeEvent),
    Delete(ChangeEvent),
    /// Liveness signal; carries nothing.
    Heartbeat,
}

impl From<ChangeEvent> for Frame {
    fn from(event: ChangeEvent) -> Self {
        match event.kind() {
            ChangeKind::Create => Frame::Create(event),
            ChangeKind::Update => Frame::Update(event),
            ChangeKind::Delete => Frame::Delete(event),
        }
    }
}

impl Frame {
    /// Unwraps the change event, checking the frame type agrees with it.
    pub fn into_event(self) -> Result<Option<ChangeEvent>> {
        let (expected, event) = match self {
            Frame::Create(event) => (ChangeKind::Create, event),
            Frame::Update(event) => (ChangeKind::Update, event),
            Frame::Delete(event) => (ChangeKind::Delete, event),
            Frame::Heartbeat => return Ok(None),
        };
        if event.kind() != expected {
            return Err(MirrorError::UnexpectedFrame(format!(
                "{} frame carries a {} event for {}",
                expected,
                event.kind(),
                event.path()
            )));
        }
        Ok(Some(event))
    }
}

/// Serializes and writes one frame, then flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(MirrorError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean end of stream at a frame boundary.
///
/// A body that fails to decode is consumed in full before the error is
/// returned, so the caller may keep reading (see
/// [`MirrorError::is_frame_local`]).
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(MirrorError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let frame = serde_json::from_slice(&payload)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_the_stream_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let create = ChangeEvent::create_file("/notes/todo.txt", "buy milk").unwrap();
        let delete = ChangeEvent::delete("/archive", true).unwrap();

        write_frame(&mut a, &Frame::from(create.clone())).await.unwrap();
        write_frame(&mut a, &Frame::Heartbeat).await.unwrap();
        write_frame(&mut a, &Frame::from(delete.clone())).await.unwrap();
        drop(a);

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first.into_event().unwrap(), Some(create));
        let second = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(second, Frame::Heartbeat);
        let third = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(third.into_event().unwrap(), Some(delete));
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn json_shape_is_type_and_payload() {
        let frame = Frame::from(ChangeEvent::create_dir("/notes").unwrap());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "create");
        assert_eq!(json["payload"]["path"], "/notes");
        assert_eq!(json["payload"]["isDirectory"], true);

        let heartbeat = serde_json::to_value(Frame::Heartbeat).unwrap();
        assert_eq!(heartbeat["type"], "heartbeat");
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let raw = r#"{"type":"delete","payload":{"kind":"create","path":"/a","isDirectory":true,"timestamp":1}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            frame.into_event(),
            Err(MirrorError::UnexpectedFrame(_))
        ));
    }

    #[tokio::test]
    async fn bad_frame_leaves_stream_at_next_boundary() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let garbage = br#"{"type":"rename"}"#;
        a.write_u32(garbage.len() as u32).await.unwrap();
        a.write_all(garbage).await.unwrap();
        write_frame(&mut a, &Frame::Heartbeat).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_frame_local());
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Frame::Heartbeat));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(MirrorError::FrameTooLarge { .. })
        ));
    }
}
