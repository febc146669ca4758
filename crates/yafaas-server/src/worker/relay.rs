//! Line relay from a worker's output pipe to one of the host's streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{error, info};

/// How a stream is split into lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Lines longer than the limit (in bytes, excluding the terminator) stop
    /// the relay with [`RelayError::LineTooLong`].
    Bounded(usize),
    /// No ceiling on line length.
    Unbounded,
}

impl ScanMode {
    /// `0` selects [`ScanMode::Unbounded`].
    pub const fn from_limit(max_line_bytes: usize) -> Self {
        if max_line_bytes == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(max_line_bytes)
        }
    }
}

/// Errors that end a relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Copy `source` to `dest` line by line until end of stream.
///
/// With `with_prefix`, each line is written as `<name>: <line>`. A final line
/// without a terminator is still relayed. Returns the number of lines written.
pub async fn relay<R, W>(
    name: &str,
    source: R,
    dest: &mut W,
    with_prefix: bool,
    mode: ScanMode,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    match mode {
        ScanMode::Bounded(max) => {
            let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max);
            let mut lines = FramedRead::new(source, codec);
            while let Some(line) = lines.next().await {
                let line = line.map_err(|e| match e {
                    AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                        RelayError::LineTooLong { max }
                    }
                    AnyDelimiterCodecError::Io(e) => RelayError::Io(e),
                })?;
                write_line(dest, name, with_prefix, &line).await?;
                written += 1;
            }
        }
        ScanMode::Unbounded => {
            let mut reader = BufReader::new(source);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                write_line(dest, name, with_prefix, &buf).await?;
                written += 1;
            }
        }
    }
    Ok(written)
}

async fn write_line<W>(
    dest: &mut W,
    name: &str,
    with_prefix: bool,
    line: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if with_prefix {
        dest.write_all(name.as_bytes()).await?;
        dest.write_all(b": ").await?;
    }
    dest.write_all(line).await?;
    dest.write_all(b"\n").await?;
    dest.flush().await
}

/// Run [`relay`] on its own task, logging how it ended.
///
/// `stream` labels the pipe (`stdout`/`stderr`) in host logs.
pub fn spawn_relay<R, W>(
    name: String,
    stream: &'static str,
    source: R,
    mut dest: W,
    with_prefix: bool,
    mode: ScanMode,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        info!(worker = %name, stream, ?mode, "Started relaying worker output");
        match relay(&name, source, &mut dest, with_prefix, mode).await {
            Ok(lines) => info!(worker = %name, stream, lines, "Finished relaying worker output"),
            Err(e) => error!(worker = %name, stream, error = %e, "Relay stopped"),
        }
    })
}
