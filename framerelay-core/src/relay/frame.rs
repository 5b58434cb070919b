//! Exact-length frame I/O over byte streams without message boundaries

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::RelayError;

/// Result of reading one frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    /// The buffer holds one complete frame
    Complete,
    /// The stream ended cleanly on a frame boundary
    Closed,
}

/// Fills `buffer` with exactly one frame, accumulating partial reads.
///
/// # Errors
///
/// - `RelayError::TruncatedFrame` - Stream ended inside a frame
/// - `RelayError::Read` - Reading from the source failed
pub async fn read_frame<R>(input: &mut R, buffer: &mut [u8]) -> Result<FrameRead, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        match input.read(&mut buffer[filled..]).await {
            Ok(0) if filled == 0 => return Ok(FrameRead::Closed),
            Ok(0) => {
                return Err(RelayError::TruncatedFrame {
                    received: filled,
                    expected: buffer.len(),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RelayError::Read(e)),
        }
    }
    Ok(FrameRead::Complete)
}

/// Writes all of `data`, retrying partial writes, then flushes.
///
/// # Errors
///
/// - `RelayError::DestinationClosed` - Reader side hung up
/// - `RelayError::Write` - Any other write failure
pub async fn write_frame<W>(output: &mut W, data: &[u8]) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < data.len() {
        match output.write(&data[written..]).await {
            Ok(0) => return Err(RelayError::DestinationClosed),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify_write_error(e)),
        }
    }

    output.flush().await.map_err(classify_write_error)
}

fn classify_write_error(error: io::Error) -> RelayError {
    match error.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::WriteZero => RelayError::DestinationClosed,
        _ => RelayError::Write(error),
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[tokio::test]
    async fn test_read_accumulates_partial_reads() {
        let mut input = Builder::new()
            .read(b"ab")
            .read(b"c")
            .read(b"def")
            .build();
        let mut buffer = [0u8; 6];

        let result = read_frame(&mut input, &mut buffer).await.unwrap();

        assert_eq!(result, FrameRead::Complete);
        assert_eq!(&buffer, b"abcdef");
    }

    #[tokio::test]
    async fn test_read_clean_close() {
        let mut input = Builder::new().build();
        let mut buffer = [0u8; 4];

        let result = read_frame(&mut input, &mut buffer).await.unwrap();
        assert_eq!(result, FrameRead::Closed);
    }

    #[tokio::test]
    async fn test_read_truncated_frame() {
        let mut input = Builder::new().read(b"abc").build();
        let mut buffer = [0u8; 4];

        let result = read_frame(&mut input, &mut buffer).await;
        assert!(matches!(
            result,
            Err(RelayError::TruncatedFrame {
                received: 3,
                expected: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let mut input = Builder::new()
            .read(b"ab")
            .read_error(io::Error::other("jitter"))
            .build();
        let mut buffer = [0u8; 4];

        let result = read_frame(&mut input, &mut buffer).await;
        assert!(matches!(result, Err(RelayError::Read(_))));
    }

    #[tokio::test]
    async fn test_write_retries_partial_writes() {
        let mut output = Builder::new().write(b"abc").write(b"def").build();

        write_frame(&mut output, b"abcdef").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_broken_pipe_is_destination_closed() {
        let mut output = Builder::new()
            .write(b"ab")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();

        let result = write_frame(&mut output, b"abcd").await;
        assert!(matches!(result, Err(RelayError::DestinationClosed)));
    }
}
