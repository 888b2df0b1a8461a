//! Control channel over a byte stream.
//!
//! [`StreamControlChannel`] implements [`ControlChannel`] on top of any
//! `AsyncRead + AsyncWrite` stream carrying decrypted control frames (see
//! `headunit_core::protocol::codec`).  Reads and writes use separate halves,
//! so a pending receive never blocks a reply send.

use async_trait::async_trait;
use headunit_core::protocol::codec::{declared_body_len, FRAME_HEADER_SIZE};
use headunit_core::{decode_frame, encode_frame, ControlMessage};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

use crate::application::bring_up::{ChannelError, ControlChannel};

/// Reads one control frame from `reader`.
///
/// # Errors
///
/// Returns [`ChannelError::Closed`] on a clean end of stream, and
/// [`ChannelError::Codec`] or [`ChannelError::Io`] otherwise.
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ChannelError::Closed,
            _ => ChannelError::Io(e),
        });
    }

    let body_len = declared_body_len(&header);
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
    frame.extend_from_slice(&header);
    frame.resize(FRAME_HEADER_SIZE + body_len, 0);
    reader.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await?;

    let (message, _) = decode_frame(&frame)?;
    trace!(kind = ?message.kind(), len = frame.len(), "control frame read");
    Ok(message)
}

/// Encodes `message` and writes it to `writer` as one frame.
///
/// # Errors
///
/// Returns [`ChannelError::Codec`] or [`ChannelError::Io`].
pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(kind = ?message.kind(), len = frame.len(), "control frame written");
    Ok(())
}

/// [`ControlChannel`] over a decrypted byte stream.
pub struct StreamControlChannel<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> StreamControlChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> ControlChannel for StreamControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn receive(&self) -> Result<ControlMessage, ChannelError> {
        let mut reader = self.reader.lock().await;
        read_message(&mut *reader).await
    }

    async fn send(&self, message: ControlMessage) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headunit_core::protocol::messages::{PingMessage, ShutdownReason, ShutdownRequest};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_messages_cross_the_stream_in_order() {
        // Arrange
        let (head_side, phone_side) = duplex(1024);
        let head = StreamControlChannel::new(head_side);
        let phone = StreamControlChannel::new(phone_side);

        // Act
        phone.send(ControlMessage::PingRequest(PingMessage { timestamp: 5 })).await.unwrap();
        phone
            .send(ControlMessage::ShutdownRequest(ShutdownRequest { reason: ShutdownReason::Quit }))
            .await
            .unwrap();

        // Assert
        assert_eq!(
            head.receive().await.unwrap(),
            ControlMessage::PingRequest(PingMessage { timestamp: 5 })
        );
        assert_eq!(
            head.receive().await.unwrap(),
            ControlMessage::ShutdownRequest(ShutdownRequest { reason: ShutdownReason::Quit })
        );
    }

    #[tokio::test]
    async fn test_send_writes_exactly_one_encoded_frame() {
        // Arrange
        let expected = encode_frame(&ControlMessage::ShutdownResponse).unwrap();
        let stream = tokio_test::io::Builder::new().write(&expected).build();
        let channel = StreamControlChannel::new(stream);

        // Act / Assert – the mock panics on any unexpected byte
        channel.send(ControlMessage::ShutdownResponse).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_reassembles_a_frame_split_across_reads() {
        // Arrange
        let frame = encode_frame(&ControlMessage::PingRequest(PingMessage { timestamp: -7 })).unwrap();
        let (head, tail) = frame.split_at(3);
        let stream = tokio_test::io::Builder::new().read(head).read(tail).build();
        let channel = StreamControlChannel::new(stream);

        // Act
        let message = channel.receive().await.unwrap();

        // Assert
        assert_eq!(message, ControlMessage::PingRequest(PingMessage { timestamp: -7 }));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_closed() {
        let (head_side, phone_side) = duplex(64);
        let head = StreamControlChannel::new(head_side);
        drop(phone_side);

        assert!(matches!(head.receive().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_garbage_frame_reports_codec_error() {
        // Arrange – valid header on channel 3, which is not the control channel
        let (head_side, mut phone_side) = duplex(64);
        let head = StreamControlChannel::new(head_side);
        phone_side.write_all(&[0x03, 0x03, 0x00, 0x02, 0x00, 0x0B]).await.unwrap();

        // Act
        let result = head.receive().await;

        // Assert
        assert!(matches!(result, Err(ChannelError::Codec(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_reports_io_error() {
        let (head_side, mut phone_side) = duplex(64);
        let head = StreamControlChannel::new(head_side);
        phone_side.write_all(&[0x00, 0x03, 0x00, 0x0A, 0x00]).await.unwrap();
        drop(phone_side);

        assert!(matches!(head.receive().await, Err(ChannelError::Io(_))));
    }
}
