//! Master/slave wire protocol.
//!
//! Every frame is a bincode-encoded message behind a length prefix. The
//! slave opens with [`SlaveFrame::Hello`]; the master answers either with a
//! [`MasterFrame::Error`] and closes, or starts sending indexed commands.
//! Responses carry the index of the command they answer. Remerge listings,
//! disk status, transfer status and operator messages arrive unsolicited.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use libvfs::LightRemoteInode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{MasterError, Result};
use crate::slave::status::{DiskStatus, TransferStatus};

/// Largest frame accepted from a slave. Remerge listings of big directories
/// are the largest messages.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Number of commands that may be outstanding on one slave connection.
pub const INDEX_POOL_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterFrame {
    /// Handshake refusal. The connection is closed right after.
    Error(NamedError),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedError {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub index: String,
    pub body: CommandBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandBody {
    Ping,
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to_dir: String,
        to_name: String,
    },
    Checksum {
        path: String,
    },
    /// Asks the slave to stream its listing of everything under `path`.
    Remerge {
        path: String,
        partial: bool,
        skip_age_cutoff: i64,
        start_time: i64,
        instant_online: bool,
    },
    RemergePause,
    RemergeResume,
    AbortTransfer {
        transfer: u64,
        reason: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveFrame {
    Hello {
        name: String,
    },
    Response(Response),
    /// Listing of one directory, deepest directories first.
    Remerge(RemergeListing),
    DiskStatus(DiskStatus),
    TransferStatus(TransferStatus),
    /// Free text for the operators.
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub index: String,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Ok,
    Checksum(u64),
    Error(RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    NotFound,
    Io,
    /// Anything the slave could not classify. The master cannot recover
    /// from these and drops the connection.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemergeListing {
    pub path: String,
    pub last_modified: i64,
    pub files: Vec<LightRemoteInode>,
}

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

pub fn frame_reader<R: AsyncRead>(inner: R) -> FrameReader<R> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_read(inner)
}

pub fn frame_writer<W: AsyncWrite>(inner: W) -> FrameWriter<W> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_write(inner)
}

pub async fn write_frame<W, T>(writer: &mut FrameWriter<W>, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg)?;
    writer.send(Bytes::from(data)).await?;
    Ok(())
}

/// Next decoded frame, or `None` once the peer has closed the stream.
pub async fn read_frame<R, T>(reader: &mut FrameReader<R>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match reader.next().await {
        Some(Ok(buf)) => Ok(Some(bincode::deserialize(&buf)?)),
        Some(Err(e)) => Err(MasterError::Io(e)),
        None => Ok(None),
    }
}

/// Two hex digits per index, `00` to `ff`.
pub fn index_name(i: usize) -> String {
    format!("{i:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_names() {
        assert_eq!(index_name(0), "00");
        assert_eq!(index_name(10), "0a");
        assert_eq!(index_name(INDEX_POOL_SIZE - 1), "ff");
    }

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = frame_writer(a);
        let mut reader = frame_reader(b);
        let hello = SlaveFrame::Hello {
            name: "slave1".to_string(),
        };
        write_frame(&mut writer, &hello).await.unwrap();
        let listing = SlaveFrame::Remerge(RemergeListing {
            path: "/mp3".to_string(),
            last_modified: 7,
            files: vec![LightRemoteInode::file("a.mp3", 3, 7)],
        });
        write_frame(&mut writer, &listing).await.unwrap();
        drop(writer);

        let got: Option<SlaveFrame> = read_frame(&mut reader).await.unwrap();
        assert_eq!(got, Some(hello));
        let got: Option<SlaveFrame> = read_frame(&mut reader).await.unwrap();
        assert_eq!(got, Some(listing));
        let got: Option<SlaveFrame> = read_frame(&mut reader).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_a_decode_error() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = frame_writer(a);
        let mut reader = frame_reader(b);
        writer.send(Bytes::from_static(&[0xff; 3])).await.unwrap();
        let got: Result<Option<SlaveFrame>> = read_frame(&mut reader).await;
        assert!(matches!(got, Err(MasterError::Bincode(_))));
    }
}
