use std::io::{self, IoSlice};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::codec::{self, HEADER_TERMINATOR};

/// Status and length of a response whose head has been consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: usize,
}

/// Where the body bytes of a response go
pub enum BodySink<'a> {
    /// Read and throw away, using the slice as scratch space
    Discard(&'a mut [u8]),
    /// Keep the body
    Collect(&'a mut Vec<u8>),
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Read once more into `buf` without letting it grow past `cap`.
///
/// Returns the number of bytes read, `0` at end of stream. A full buffer is
/// an `InvalidData` error: header blocks are never streamed.
pub async fn fill_buf<S>(stream: &mut S, buf: &mut Vec<u8>, cap: usize) -> io::Result<usize>
where
    S: AsyncRead + Unpin + ?Sized,
{
    if buf.len() >= cap {
        return Err(invalid_data("header block exceeds buffer capacity"));
    }
    // Read into spare capacity; `take` keeps the buffer within `cap`
    let room = cap - buf.len();
    buf.reserve(room);
    (&mut *stream).take(room as u64).read_buf(buf).await
}

/// Write every slice, issuing as few `writev` calls as the socket allows
pub async fn write_all_vectored<W>(writer: &mut W, mut bufs: &mut [IoSlice<'_>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut remaining: usize = bufs.iter().map(|b| b.len()).sum();
    while remaining > 0 {
        let written = writer.write_vectored(bufs).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        remaining -= written;
        IoSlice::advance_slices(&mut bufs, written);
    }
    writer.flush().await
}

/// Read a response head from `stream` into `head_buf` (bounded by `cap`),
/// then consume exactly `Content-Length` body bytes into `sink`.
///
/// The stream is left positioned at the first byte after the body, which is
/// what keeps a pooled connection usable for the next request. Exchanges are
/// lockstep, so nothing is expected past the body.
pub async fn read_response<S>(
    stream: &mut S,
    head_buf: &mut Vec<u8>,
    cap: usize,
    sink: BodySink<'_>,
) -> io::Result<ResponseHead>
where
    S: AsyncRead + Unpin + ?Sized,
{
    head_buf.clear();

    let line_end = loop {
        if let Some(i) = head_buf.iter().position(|&b| b == b'\n') {
            break i;
        }
        if fill_buf(stream, head_buf, cap).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    };
    let status = codec::parse_status_line(&head_buf[..line_end])
        .ok_or_else(|| invalid_data("malformed status line"))?;

    let header_end = loop {
        if let Some(i) = codec::find_header_end(head_buf) {
            break i;
        }
        if fill_buf(stream, head_buf, cap).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    };
    let content_length = codec::parse_content_length(&head_buf[..header_end]).unwrap_or(0);

    let body_start = header_end + HEADER_TERMINATOR.len();
    let buffered = (head_buf.len() - body_start).min(content_length);
    let mut remaining = content_length - buffered;

    match sink {
        BodySink::Discard(scratch) => {
            while remaining > 0 {
                let want = remaining.min(scratch.len());
                let n = stream.read(&mut scratch[..want]).await?;
                if n == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                remaining -= n;
            }
        }
        BodySink::Collect(body) => {
            body.clear();
            body.extend_from_slice(&head_buf[body_start..body_start + buffered]);
            if remaining > 0 {
                let start = body.len();
                body.resize(start + remaining, 0);
                stream.read_exact(&mut body[start..]).await?;
            }
        }
    }

    Ok(ResponseHead { status, content_length })
}
