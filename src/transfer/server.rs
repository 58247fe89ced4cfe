//! Transfer server: one task per inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{DIGEST_ALG, FILE_CHUNK, MAX_NAME, TCP_FILE_SEND_TIMEOUT};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::wire::transfer::{Headers, Method, Request, Response, StatusCode};

const LINE_SEP: &str = "\r\n";

/// Accepts connections on `bind_addr` until `shutdown` fires.
pub async fn serve(
    controller: Arc<Controller>,
    bind_addr: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("transfer server listening on {bind_addr}");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(controller, stream, peer).await {
                        warn!("transfer connection with {peer} failed: {e}");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("transfer server on {bind_addr} shutting down");
                return Ok(());
            }
        }
    }
}

async fn read_head(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Result<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::ParseError("connection closed before headers completed".into()));
        }
        let blank = line == "\r\n" || line == "\n";
        head.push_str(&line);
        if blank {
            break;
        }
    }
    Ok(head)
}

async fn write_response(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    response: &Response,
) -> std::io::Result<()> {
    writer.write_all(response.to_head_string().as_bytes()).await
}

async fn respond_error(writer: &mut tokio::net::tcp::OwnedWriteHalf, status: StatusCode) -> std::io::Result<()> {
    let mut response = Response::new(status);
    response.headers.set_content_length(0);
    write_response(writer, &response).await
}

async fn handle_connection(controller: Arc<Controller>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match read_head(&mut reader).await {
        Ok(head) => head,
        Err(_) => {
            respond_error(&mut write_half, StatusCode::BadRequest400).await?;
            return Ok(());
        }
    };

    let request = match Request::parse_head(&head) {
        Ok(r) => r,
        Err(_) => {
            respond_error(&mut write_half, StatusCode::BadRequest400).await?;
            return Ok(());
        }
    };

    let range = match request.headers.range() {
        Ok(r) => r,
        Err(_) => {
            respond_error(&mut write_half, StatusCode::BadRequest400).await?;
            return Ok(());
        }
    };
    if let Some((unit, _)) = &range {
        if unit != "bytes" {
            respond_error(&mut write_half, StatusCode::BadRequest400).await?;
            return Ok(());
        }
    }

    if request.name.len() > MAX_NAME {
        respond_error(&mut write_half, StatusCode::BadRequest400).await?;
        return Ok(());
    }

    let metadata = match controller.get_file(&request.name) {
        Ok(m) => m,
        Err(_) => {
            respond_error(&mut write_half, StatusCode::NotFound404).await?;
            return Ok(());
        }
    };

    match request.headers.digest_header("if-digest") {
        Ok(Some((alg, value))) => {
            if alg != DIGEST_ALG {
                respond_error(&mut write_half, StatusCode::BadRequest400).await?;
                return Ok(());
            }
            if value != metadata.current_digest {
                respond_error(&mut write_half, StatusCode::PreconditionFailed412).await?;
                return Ok(());
            }
        }
        Ok(None) => {}
        Err(_) => {
            respond_error(&mut write_half, StatusCode::BadRequest400).await?;
            return Ok(());
        }
    }

    let guard = match controller.attach_consumer(&request.name, peer) {
        Ok(g) => g,
        Err(_) => {
            respond_error(&mut write_half, StatusCode::NotFound404).await?;
            return Ok(());
        }
    };

    let total = metadata.current_size;
    let (start, end) = match range {
        Some((_, byte_range)) => {
            if byte_range.start > total {
                respond_error(&mut write_half, StatusCode::RangeNotSatisfiable416).await?;
                return Ok(());
            }
            let end = byte_range.end.map(|e| e.min(total.saturating_sub(1))).unwrap_or(total.saturating_sub(1));
            (byte_range.start, end)
        }
        None => (0, total.saturating_sub(1)),
    };

    let body_len = if start > end { 0 } else { end - start + 1 };
    let whole_file = start == 0 && body_len == total;
    let status = if whole_file { StatusCode::Ok200 } else { StatusCode::PartialContent206 };

    let mut headers = Headers::new();
    headers.set_content_length(body_len);
    headers.set("content-type", "application/octet-stream");
    if !whole_file {
        headers.set_content_range(start, start + body_len.saturating_sub(1), total);
    }
    if !metadata.current_digest.is_empty() {
        headers.set_digest_header("digest", DIGEST_ALG, &metadata.current_digest);
    }
    let response = Response { status, headers };
    write_response(&mut write_half, &response).await?;

    if request.method == Method::Head || body_len == 0 {
        return Ok(());
    }

    let stream_result = stream_body(&mut write_half, &metadata.path, start, body_len, &guard).await;
    if let Err(e) = stream_result {
        if matches!(e, Error::InconsistentFileState) {
            let _ = controller.mark_invalid(&request.name);
        }
        return Err(e);
    }
    Ok(())
}

async fn stream_body(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    path: &std::path::Path,
    start: u64,
    len: u64,
    guard: &crate::transfer::context::ConsumerGuard,
) -> Result<()> {
    use tokio::io::AsyncSeekExt;

    let mut file = tokio::fs::File::open(path).await.map_err(|_| Error::InconsistentFileState)?;
    file.seek(std::io::SeekFrom::Start(start)).await.map_err(|_| Error::InconsistentFileState)?;

    let mut remaining = len;
    let mut buf = vec![0u8; FILE_CHUNK];
    while remaining > 0 {
        if guard.is_stopped() {
            return Ok(());
        }
        let chunk = remaining.min(FILE_CHUNK as u64) as usize;
        let n = timeout(TCP_FILE_SEND_TIMEOUT, file.read(&mut buf[..chunk]))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::InconsistentFileState)?;
        if n == 0 {
            return Err(Error::InconsistentFileState);
        }
        timeout(TCP_FILE_SEND_TIMEOUT, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| Error::Timeout)??;
        remaining -= n as u64;
    }
    Ok(())
}
