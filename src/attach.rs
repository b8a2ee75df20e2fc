//! Local attach socket: lets other host processes share the one physical
//! device by connecting to a per-process Unix socket (plus a stable
//! symlink) and having their frames forwarded upstream through the
//! [`Router`].
//!
//! One task accepts connections; each accepted connection gets its own
//! pair of tasks, a reader forwarding frames in and a writer draining the
//! router's broadcast feed out.

use std::path::{Path, PathBuf};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::frame::{self, Frame, FrameError};
use crate::router::{Router, Token};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compute the per-process socket path and the stable basename-derived
/// symlink path for a device opened at `device_path`, both rooted at the
/// system temp directory.
pub fn socket_paths(device_path: &str) -> (PathBuf, PathBuf) {
    let tmp = std::env::temp_dir();
    let sock_name = format!("luatt.{}", std::process::id());
    let base = Path::new(device_path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| device_path.to_string());
    let link_name = format!("luatt.{base}");
    (tmp.join(sock_name), tmp.join(link_name))
}

/// Bind the attach socket, create its symlink, and accept connections
/// until cancelled. Removes both paths on the way out.
pub async fn serve(
    sock_path: &Path,
    link_path: &Path,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), AttachError> {
    let _ = std::fs::remove_file(sock_path);
    let listener = UnixListener::bind(sock_path)?;

    let _ = std::fs::remove_file(link_path);
    if let Some(sock_name) = sock_path.file_name() {
        std::os::unix::fs::symlink(sock_name, link_path)?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let router = router.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(handle_connection(stream, router, cancel));
                    }
                    Err(e) => warn!("attach socket accept failed: {e}"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(sock_path);
    let _ = std::fs::remove_file(link_path);
    Ok(())
}

async fn handle_connection(stream: UnixStream, router: Router, cancel: CancellationToken) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (client_id, mut broadcast_rx) = router.register_client().await;

    let writer_cancel = cancel.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = broadcast_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let mut buf = BytesMut::new();
                    frame::encode(&frame, &mut buf);
                    if write_half.write_all(&buf).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = read_one_frame(&mut read_half, &mut buf) => outcome,
        };
        match outcome {
            Ok(Some(frame)) => {
                let token = Token::from_str(&String::from_utf8_lossy(frame.token()));
                router.note_client_token(client_id, &token).await;
                if let Err(e) = router.write_frame(&frame).await {
                    warn!("forwarding downstream frame upstream failed: {e}");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("malformed frame from downstream client: {e}");
                buf.clear();
            }
        }
    }

    router.deregister_client(client_id).await;
    writer_task.abort();
}

async fn read_one_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match frame::try_parse(buf) {
            Ok(Some(f)) => return Ok(Some(f)),
            Ok(None) => {
                let mut chunk = [0u8; 4096];
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn socket_paths_derive_from_pid_and_device_basename() {
        let (sock, link) = socket_paths("/dev/cu.usbmodemFD114301");
        assert_eq!(
            sock.file_name().unwrap().to_str().unwrap(),
            format!("luatt.{}", std::process::id())
        );
        assert_eq!(
            link.file_name().unwrap().to_str().unwrap(),
            "luatt.cu.usbmodemFD114301"
        );
    }

    #[tokio::test]
    async fn downstream_client_frame_is_forwarded_upstream_and_broadcast_back() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("luatt.test");
        let link_path = dir.path().join("luatt.link");

        let (upstream_a, mut upstream_b) = UnixStream::pair().unwrap();
        let cancel = CancellationToken::new();
        let (router, _default_output) = Router::new(Transport::Local(upstream_a), cancel.clone());
        let router_run = {
            let router = router.clone();
            tokio::spawn(async move { router.run().await })
        };

        let serve_task = {
            let router = router.clone();
            let cancel = cancel.clone();
            let sock_path = sock_path.clone();
            let link_path = link_path.clone();
            tokio::spawn(async move { serve(&sock_path, &link_path, router, cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = UnixStream::connect(&sock_path).await.unwrap();
        let mut out = BytesMut::new();
        frame::encode(
            &Frame::new(vec![Bytes::from_static(b"T1"), Bytes::from_static(b"eval"), Bytes::from_static(b"1+1")]),
            &mut out,
        );
        client.write_all(&out).await.unwrap();

        let mut upstream_buf = BytesMut::with_capacity(256);
        let mut chunk = [0u8; 256];
        let n = upstream_b.read(&mut chunk).await.unwrap();
        upstream_buf.extend_from_slice(&chunk[..n]);
        let forwarded = frame::try_parse(&mut upstream_buf).unwrap().unwrap();
        assert_eq!(forwarded.fields[0].as_ref(), b"T1");

        // upstream pushes a reply; the downstream client should see it
        // via the router's broadcast path.
        let mut reply = BytesMut::new();
        frame::encode(
            &Frame::new(vec![Bytes::from_static(b"T1"), Bytes::from_static(b"ret"), Bytes::from_static(b"2")]),
            &mut reply,
        );
        upstream_b.write_all(&reply).await.unwrap();

        let mut client_buf = BytesMut::with_capacity(256);
        let mut chunk = [0u8; 256];
        let n = client.read(&mut chunk).await.unwrap();
        client_buf.extend_from_slice(&chunk[..n]);
        let echoed = frame::try_parse(&mut client_buf).unwrap().unwrap();
        assert_eq!(echoed.fields[2].as_ref(), b"2");

        cancel.cancel();
        let _ = serve_task.await;
        let _ = router_run.await;
    }
}
