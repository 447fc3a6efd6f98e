use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer_pool::{get_buffer, return_buffer};

/// How long the surviving direction may keep running after its peer ends.
pub const GRACE_PERIOD: Duration = Duration::from_millis(2_000);

/// Byte counts moved in each direction over the lifetime of a pump.
#[derive(Debug, Default, Clone, Copy)]
pub struct PumpSummary {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relay bytes between `client` and `upstream` until both directions end.
///
/// Each direction runs as its own task and ends on end-of-stream, on an I/O
/// error, or when `cancel` fires. Once the first direction ends, the second
/// is given [`GRACE_PERIOD`] to finish naturally before `cancel` is fired.
/// Neither channel is shut down until both directions have ended.
pub async fn run<A, B>(client: A, upstream: B, cancel: CancellationToken) -> PumpSummary
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let mut up = tokio::spawn(relay(client_read, upstream_write, cancel.clone()));
    let mut down = tokio::spawn(relay(upstream_read, client_write, cancel.clone()));

    let (up_out, down_out) = tokio::select! {
        first = &mut up => (first, grace_wait(&mut down, &cancel).await),
        first = &mut down => {
            let down_out = first;
            let up_out = grace_wait(&mut up, &cancel).await;
            (up_out, down_out)
        }
    };

    let mut summary = PumpSummary::default();
    if let Ok((copied, mut writer)) = up_out {
        summary.client_to_upstream = copied;
        let _ = writer.shutdown().await;
    }
    if let Ok((copied, mut writer)) = down_out {
        summary.upstream_to_client = copied;
        let _ = writer.shutdown().await;
    }
    summary
}

/// Wait for the surviving direction, cancelling it once the grace elapses.
async fn grace_wait<T>(peer: &mut JoinHandle<T>, cancel: &CancellationToken) -> Result<T, JoinError> {
    match timeout(GRACE_PERIOD, &mut *peer).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            peer.await
        }
    }
}

async fn relay<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken) -> (u64, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = get_buffer(false).await;
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    if let Err(error) = writer.flush().await {
                        debug!(%error, "flush after end-of-stream failed");
                    }
                    break;
                }
                Ok(n) => n,
                Err(error) => {
                    debug!(%error, "relay read failed");
                    break;
                }
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        match written {
            Ok(()) => copied += n as u64,
            Err(error) => {
                debug!(%error, "relay write failed");
                break;
            }
        }
    }

    return_buffer(buf, false).await;
    (copied, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::{advance, sleep};

    #[tokio::test]
    async fn relays_bytes_in_both_directions() {
        let (client_side, mut client) = duplex(256);
        let (upstream_side, mut upstream) = duplex(256);

        let pump = tokio::spawn(run(client_side, upstream_side, CancellationToken::new()));

        client.write_all(b"to-upstream").await.unwrap();
        let mut buf = [0u8; 11];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-upstream");

        upstream.write_all(b"to-client").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-client");

        drop(client);
        drop(upstream);
        let summary = pump.await.unwrap();
        assert_eq!(summary.client_to_upstream, 11);
        assert_eq!(summary.upstream_to_client, 9);
    }

    #[tokio::test]
    async fn preserves_byte_order_within_a_direction() {
        let (client_side, mut client) = duplex(64);
        let (upstream_side, mut upstream) = duplex(64);

        let pump = tokio::spawn(run(client_side, upstream_side, CancellationToken::new()));

        let mut expected = Vec::new();
        for i in 0u16..200 {
            let chunk = i.to_be_bytes();
            expected.extend_from_slice(&chunk);
            client.write_all(&chunk).await.unwrap();
        }
        drop(client);

        let mut seen = vec![0u8; expected.len()];
        upstream.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, expected);
        drop(upstream);
        pump.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drains_slow_peer_within_grace_period() {
        let (client_side, mut client) = duplex(256);
        let (upstream_side, mut upstream) = duplex(256);

        let pump = tokio::spawn(run(client_side, upstream_side, CancellationToken::new()));

        // Client finishes immediately; upstream keeps talking for a while
        client.write_all(b"last-words").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 10];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last-words");

        upstream.write_all(b"slow ").await.unwrap();
        sleep(Duration::from_millis(500)).await;
        upstream.write_all(b"reply").await.unwrap();
        drop(upstream);

        let mut seen = Vec::new();
        client.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"slow reply");

        let summary = pump.await.unwrap();
        assert_eq!(summary.client_to_upstream, 10);
        assert_eq!(summary.upstream_to_client, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_stalled_peer_after_grace_period() {
        let (client_side, client) = duplex(256);
        let (upstream_side, upstream) = duplex(256);

        let pump = tokio::spawn(run(client_side, upstream_side, CancellationToken::new()));

        // Client direction ends immediately; upstream never speaks
        drop(client);

        let summary = pump.await.unwrap();
        assert_eq!(summary.client_to_upstream, 0);
        assert_eq!(summary.upstream_to_client, 0);
        drop(upstream);
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancellation_stops_both_directions() {
        let (client_side, client) = duplex(256);
        let (upstream_side, upstream) = duplex(256);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run(client_side, upstream_side, cancel.clone()));

        advance(Duration::from_millis(10)).await;
        cancel.cancel();
        pump.await.unwrap();

        drop(client);
        drop(upstream);
    }
}
