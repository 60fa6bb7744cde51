use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const CTRL_VERSION: u8 = 0x80;
pub const CTRL_EXECUTE: u8 = 0x90;
pub const CTRL_COMPLETED: u8 = 0x91;
pub const CTRL_LOG_MESSAGE: u8 = 0xe0;

/// Upper bound on a frame payload; anything larger is a protocol violation.
pub const MAX_FRAME_BYTES: u32 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error reading frame: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversize(u32),

    #[error("frame payload truncated")]
    Truncated,

    #[error("frame string is not valid UTF-8")]
    Utf8,

    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// One protocol frame. On the wire: a u32 big-endian payload length, the
/// control byte, then the payload. Strings inside a payload carry their own
/// u32 big-endian length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake; the capacity advertisement is present only when the sender
    /// is offering its workers.
    Version { version: u8, capacity: Option<u64> },
    /// Dispatch a job for remote execution.
    Execute { job: String },
    /// Report remote completion of a job.
    Completed { job: String },
    /// Forward a structured (JSON) log record.
    LogMessage { record: String },
    /// A control byte this build does not know. The payload has already been
    /// consumed; the dispatcher only warns.
    Unknown { control: u8 },
}

impl Frame {
    pub fn control(&self) -> u8 {
        match self {
            Frame::Version { .. } => CTRL_VERSION,
            Frame::Execute { .. } => CTRL_EXECUTE,
            Frame::Completed { .. } => CTRL_COMPLETED,
            Frame::LogMessage { .. } => CTRL_LOG_MESSAGE,
            Frame::Unknown { control } => *control,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Frame::Version { version, capacity } => {
                payload.push(*version);
                if let Some(capacity) = capacity {
                    payload.extend_from_slice(&capacity.to_be_bytes());
                }
            }
            Frame::Execute { job } | Frame::Completed { job } => put_string(&mut payload, job),
            Frame::LogMessage { record } => put_string(&mut payload, record),
            Frame::Unknown { .. } => {}
        }
        let mut out = Vec::with_capacity(5 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.push(self.control());
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(control: u8, payload: &[u8]) -> Result<Frame, FrameError> {
        let mut cursor = Cursor { buf: payload };
        match control {
            CTRL_VERSION => {
                let version = cursor.u8()?;
                let capacity = if cursor.remaining() >= 8 {
                    Some(cursor.u64()?)
                } else {
                    None
                };
                Ok(Frame::Version { version, capacity })
            }
            CTRL_EXECUTE => Ok(Frame::Execute {
                job: cursor.string()?,
            }),
            CTRL_COMPLETED => Ok(Frame::Completed {
                job: cursor.string()?,
            }),
            CTRL_LOG_MESSAGE => Ok(Frame::LogMessage {
                record: cursor.string()?,
            }),
            control => Ok(Frame::Unknown { control }),
        }
    }
}

/// Read one frame. `Ok(None)` means the stream closed cleanly at a frame
/// boundary; EOF inside a frame is reported as `Truncated`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err.into());
    }
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Oversize(len));
    }
    let control = reader.read_u8().await.map_err(eof_is_truncated)?;
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_is_truncated)?;
    Ok(Some(Frame::decode(control, &payload)?))
}

fn eof_is_truncated(err: io::Error) -> FrameError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(err)
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.buf.len() < n {
            return Err(FrameError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let len = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(len);
        let len = u32::from_be_bytes(buf) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode();
        let mut reader = &bytes[..];
        read_frame(&mut reader)
            .await
            .expect("frame decodes")
            .expect("frame present")
    }

    #[tokio::test]
    async fn version_roundtrip_with_capacity() {
        let frame = Frame::Version {
            version: 1,
            capacity: Some(12),
        };
        assert_eq!(roundtrip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn version_roundtrip_without_capacity() {
        let frame = Frame::Version {
            version: 1,
            capacity: None,
        };
        assert_eq!(roundtrip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn string_frames_roundtrip() {
        for frame in [
            Frame::Execute {
                job: "convert a.png".into(),
            },
            Frame::Completed {
                job: "convert a.png".into(),
            },
            Frame::LogMessage {
                record: r#"{"level":"WARN"}"#.into(),
            },
        ] {
            assert_eq!(roundtrip(frame.clone()).await, frame);
        }
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut reader = &[][..];
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_truncated() {
        let bytes = Frame::Execute { job: "abc".into() }.encode();
        let mut reader = &bytes[..bytes.len() - 1];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversize_frame_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        bytes.push(CTRL_EXECUTE);
        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn unknown_control_is_surfaced_not_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.push(0x42);
        bytes.extend_from_slice(&[0xde, 0xad]);
        let mut reader = &bytes[..];
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Some(Frame::Unknown { control: 0x42 })
        );
    }

    #[test]
    fn string_length_overrun_is_truncated() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(b"short");
        assert!(matches!(
            Frame::decode(CTRL_EXECUTE, &payload),
            Err(FrameError::Truncated)
        ));
    }
}
