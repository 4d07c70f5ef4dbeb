//! Line framing for the agent control protocol
//!
//! The protocol is ASCII, `\n`-terminated, one field per line, no line
//! longer than 512 bytes including the terminator. `\r` is ignored. An
//! overlong or non-ASCII line closes the connection with no reply.

use thiserror::Error;
use tokio::io::AsyncBufReadExt;

/// Maximum control line length in bytes, terminator included
pub const MAX_LINE_BYTES: usize = 512;

/// First-line prefix marking an agent data connection
pub const DATA_PREFIX: &str = "DATA:";

/// Notification that an external connection is waiting to be paired
pub const CONNECT_LINE: &[u8] = b"CONNECT\n";

/// Prefix of the pairing id line that follows `CONNECT`
pub const CONN_ID_PREFIX: &str = "CONN_ID:";

/// Reply prefix for a successful authentication
pub const SUCCESS_PREFIX: &str = "SUCCESS:";

/// Reply prefix for a failed authentication or setup
pub const ERROR_PREFIX: &str = "ERROR:";

/// Canned reply for a failed authentication
pub const AUTH_FAILED_REPLY: &[u8] = b"ERROR:Invalid token or authentication failed\n";

/// Framing errors
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("control line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    #[error("control line contains non-ASCII bytes")]
    NotAscii,

    #[error("stream ended mid-line")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one `\n`-terminated line of at most [`MAX_LINE_BYTES`] bytes.
///
/// Returns `Ok(None)` on a clean EOF before any byte. `\r` bytes are
/// stripped wherever they appear. The scan works on the reader's internal
/// buffer, so bytes past the terminator stay buffered for the caller.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, FramingError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line: Vec<u8> = Vec::new();

    loop {
        let (consumed, found_terminator) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(FramingError::UnexpectedEof);
            }

            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if line.len() + pos + 1 > MAX_LINE_BYTES {
                        return Err(FramingError::LineTooLong);
                    }
                    line.extend_from_slice(&buf[..pos]);
                    (pos + 1, true)
                }
                None => {
                    if line.len() + buf.len() + 1 > MAX_LINE_BYTES {
                        return Err(FramingError::LineTooLong);
                    }
                    line.extend_from_slice(buf);
                    (buf.len(), false)
                }
            }
        };

        reader.consume(consumed);
        if found_terminator {
            break;
        }
    }

    if !line.is_ascii() {
        return Err(FramingError::NotAscii);
    }

    line.retain(|&b| b != b'\r');
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| FramingError::NotAscii)
}
