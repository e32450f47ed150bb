//! Forwarding of the sandbox's standard output streams.
//!
//! Whatever the sandboxed program writes to descriptors 1 and 2 is copied
//! unchanged to the host's own stdout and stderr. Nothing here parses the
//! stream; the message protocol only ever runs on the channels.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Copy `reader` into `writer` until end of stream, flushing at the end.
///
/// Returns the number of bytes forwarded.
pub async fn forward_output<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    Ok(copied)
}

/// Spawn tasks that forward the sandbox's stdout and stderr to the host's.
///
/// Errors end the affected stream and are logged.
pub fn spawn_stdio_forwarding<O, E>(stdout: O, stderr: E) -> (JoinHandle<()>, JoinHandle<()>)
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let out = tokio::spawn(async move {
        match forward_output(stdout, tokio::io::stdout()).await {
            Ok(n) => tracing::debug!(bytes = n, "Sandbox stdout closed"),
            Err(e) => tracing::warn!("Sandbox stdout forwarding failed: {}", e),
        }
    });
    let err = tokio::spawn(async move {
        match forward_output(stderr, tokio::io::stderr()).await {
            Ok(n) => tracing::debug!(bytes = n, "Sandbox stderr closed"),
            Err(e) => tracing::warn!("Sandbox stderr forwarding failed: {}", e),
        }
    });
    (out, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_forward_output_copies_verbatim() {
        let (mut sandbox, host) = duplex(64);
        let mut sink = Cursor::new(Vec::new());

        let writer = tokio::spawn(async move {
            sandbox.write_all(b"line one\n").await.unwrap();
            sandbox.write_all(b"\x00binary\xff").await.unwrap();
        });

        let copied = forward_output(host, &mut sink).await.unwrap();
        writer.await.unwrap();

        assert_eq!(copied, 17);
        assert_eq!(sink.into_inner(), b"line one\n\x00binary\xff".to_vec());
    }

    #[tokio::test]
    async fn test_spawned_forwarders_finish_on_eof() {
        let (out_tx, out_rx) = duplex(16);
        let (err_tx, err_rx) = duplex(16);
        drop(out_tx);
        drop(err_tx);

        let (out, err) = spawn_stdio_forwarding(out_rx, err_rx);
        out.await.unwrap();
        err.await.unwrap();
    }
}
