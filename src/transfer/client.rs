//! Transfer client: one download per call.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::config::{DIGEST_ALG, FILE_CHUNK, TCP_FILE_RECEIVE_TIMEOUT};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::wire::transfer::{Method, Request, Response};

/// Downloads `name` from `endpoint`, resuming from whatever the local copy
/// already has, and reports outcome back to the controller.
pub async fn download(controller: Arc<Controller>, name: String, endpoint: SocketAddr) -> Result<()> {
    let metadata = controller.get_file(&name)?;
    let guard = controller.attach_provider(&name, endpoint.ip())?;

    let stream = TcpStream::connect(endpoint).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request = Request::new(Method::Get, &name);
    if !metadata.digest.is_empty() {
        request.headers.set_digest_header("if-digest", DIGEST_ALG, &metadata.digest);
    }
    if metadata.current_size > 0 {
        request.headers.set_range(metadata.current_size);
    }
    write_half.write_all(request.to_head_string().as_bytes()).await?;

    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::ProtocolError("connection closed before response headers completed".into()));
        }
        let blank = line == "\r\n" || line == "\n";
        head.push_str(&line);
        if blank {
            break;
        }
    }
    let response = Response::parse_head(&head).map_err(|e| Error::ProtocolError(e.to_string()))?;
    if !response.status.is_success() {
        return Err(Error::ProtocolError(format!("remote responded {}", response.status.code())));
    }
    response.assert_has_body_if_ok()?;

    let content_length = response
        .headers
        .content_length()?
        .ok_or_else(|| Error::ProtocolError("missing content-length".into()))?;
    let (offset, total) = match response.headers.content_range()? {
        Some(cr) => (cr.start, cr.total),
        None => (0, content_length),
    };

    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&metadata.path)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut written = offset;
    let end = offset + content_length;
    let mut buf = vec![0u8; FILE_CHUNK];
    while written < end {
        if guard.is_stopped() {
            break;
        }
        let chunk = ((end - written).min(FILE_CHUNK as u64)) as usize;
        let n = timeout(TCP_FILE_RECEIVE_TIMEOUT, reader.read(&mut buf[..chunk]))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
        guard.report_progress(written);
    }
    file.set_len(written).await?;
    file.flush().await?;

    if written < total {
        return Err(Error::ShortTransfer { got: written, expected: total });
    }

    let record = controller.finalize_download(&name).await?;
    if record.is_valid() {
        controller.mark_ready(&name)?;
        info!("download of '{name}' complete, fingerprint {}", record.fingerprint());
        Ok(())
    } else {
        Err(Error::InvalidDownload)
    }
}
