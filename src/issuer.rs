//! Request issuer: allocates tokens, sends frames upstream through the
//! router, and blocks the caller until a terminal `ret` reply arrives.
//!
//! A request sends a frame, blocks reading replies, and returns once a
//! terminal `ret` arrives, streaming any intermediate frames to a
//! caller-supplied callback along the way.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::debug;

use crate::frame::Frame;
use crate::router::{Router, Token};

const STARTUP_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("router is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Router(#[from] crate::router::RouterError),
    #[error("startup handshake timed out waiting for a `version` frame")]
    VersionTimeout,
}

/// Send `verb`/`args` under a fresh token, wait for the terminal `ret`
/// frame, and return it. Intermediate frames sharing the token (streamed
/// output) are passed to `on_intermediate` as they arrive rather than
/// discarded.
pub async fn request<F>(
    router: &Router,
    verb: &str,
    args: &[Bytes],
    mut on_intermediate: F,
) -> Result<Frame, IssuerError>
where
    F: FnMut(&Frame),
{
    let token = Token::generate();
    let mut rx = router.register_pending(&token).await;

    let frame = build_frame(&token, verb, args);
    let result = router.write_frame(&frame).await;
    if let Err(e) = result {
        router.deregister_pending(&token).await;
        return Err(e.into());
    }

    let outcome = wait_for_ret(&mut rx, &mut on_intermediate).await;
    router.deregister_pending(&token).await;
    outcome
}

/// Send `verb`/`args` under the reserved `noret` token; does not wait for
/// or expect a reply.
pub async fn fire_and_forget(router: &Router, verb: &str, args: &[Bytes]) -> Result<(), IssuerError> {
    let frame = build_frame(&Token::noret(), verb, args);
    router.write_frame(&frame).await?;
    Ok(())
}

fn build_frame(token: &Token, verb: &str, args: &[Bytes]) -> Frame {
    let mut fields = Vec::with_capacity(2 + args.len());
    fields.push(Bytes::copy_from_slice(token.as_str().as_bytes()));
    fields.push(Bytes::copy_from_slice(verb.as_bytes()));
    fields.extend(args.iter().cloned());
    Frame::new(fields)
}

async fn wait_for_ret<F>(
    rx: &mut UnboundedReceiver<Frame>,
    on_intermediate: &mut F,
) -> Result<Frame, IssuerError>
where
    F: FnMut(&Frame),
{
    loop {
        let frame = rx.recv().await.ok_or(IssuerError::ShuttingDown)?;
        let is_ret = frame.verb() == Some(b"ret");
        // The terminal `ret` frame is reported through the same callback
        // as every intermediate frame before it, mirroring the original's
        // unconditional print-then-check-verb order.
        on_intermediate(&frame);
        if is_ret {
            return Ok(frame);
        }
    }
}

/// Startup synchronization: install a reply queue under the reserved
/// `sched` token and wait up to 10 seconds for a frame whose verb is
/// `version`. Called once, right after opening a serial transport.
pub async fn wait_for_version(router: &Router) -> Result<Frame, IssuerError> {
    let mut rx = router.register_pending(&Token::sched()).await;
    let result = timeout(STARTUP_HANDSHAKE_TIMEOUT, async {
        loop {
            let frame = rx.recv().await.ok_or(IssuerError::ShuttingDown)?;
            if frame.verb() == Some(b"version") {
                debug!("device reported version frame: {:?}", frame.fields);
                return Ok(frame);
            }
        }
    })
    .await;
    router.deregister_pending(&Token::sched()).await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(IssuerError::VersionTimeout),
    }
}
