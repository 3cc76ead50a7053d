use crate::keepalive::{FrameTracker, Keepalive};
use log::{debug, warn};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PUMP_BUFFER_SIZE: usize = 32 * 1024;

/// One accepted upgrade: the hijacked client stream, the freshly dialed
/// backend stream and the keepalive applied towards the backend.
pub struct UpgradeSession<C, B> {
    client: C,
    backend: B,
    keepalive: Keepalive,
}

/// Bytes moved in each direction before the session ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

impl<C, B> UpgradeSession<C, B>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(client: C, backend: B, keepalive: Keepalive) -> Self {
        Self {
            client,
            backend,
            keepalive,
        }
    }

    /// Splices both streams until either direction ends, then closes both.
    pub async fn run(self) -> SessionStats {
        let (client_read, client_write) = tokio::io::split(self.client);
        let (backend_read, backend_write) = tokio::io::split(self.backend);

        let mut upstream = tokio::spawn(pump_with_keepalive(client_read, backend_write, self.keepalive));
        let mut downstream = tokio::spawn(pump(backend_read, client_write));

        let mut stats = SessionStats::default();
        // Whichever side finishes first tears the other down; dropping the
        // aborted task's halves closes the remaining connection.
        tokio::select! {
            result = &mut upstream => {
                stats.client_to_backend = finished("client -> backend", result);
                downstream.abort();
                if let Ok(Ok(n)) = downstream.await {
                    stats.backend_to_client = n;
                }
            }
            result = &mut downstream => {
                stats.backend_to_client = finished("backend -> client", result);
                upstream.abort();
                if let Ok(Ok(n)) = upstream.await {
                    stats.client_to_backend = n;
                }
            }
        }

        debug!(
            "Upgrade session closed: client -> backend {} bytes, backend -> client {} bytes",
            stats.client_to_backend, stats.backend_to_client
        );
        stats
    }
}

fn finished(direction: &str, result: Result<io::Result<u64>, tokio::task::JoinError>) -> u64 {
    match result {
        Ok(Ok(n)) => {
            debug!("{} reached end of stream after {} bytes", direction, n);
            n
        }
        Ok(Err(e)) => {
            debug!("{} ended with error: {}", direction, e);
            0
        }
        Err(e) => {
            warn!("{} task failed: {}", direction, e);
            0
        }
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    let _ = writer.shutdown().await;
    Ok(copied)
}

/// Copies reader to writer; whenever the reader stays quiet for a full ping
/// period a ping frame is written instead. A ping that falls due while a
/// frame is half forwarded waits for the next quiet period at a frame
/// boundary. Ping failures are only logged.
pub async fn pump_with_keepalive<R, W>(mut reader: R, mut writer: W, keepalive: Keepalive) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !keepalive.is_enabled() {
        return pump(reader, writer).await;
    }

    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut copied = 0u64;
    let mut pings = 0u32;
    let mut frames = FrameTracker::new(keepalive.frame());

    loop {
        let idle = tokio::time::sleep(keepalive.period());
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    let _ = writer.shutdown().await;
                    return Ok(copied);
                }
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                frames.observe(&buf[..n]);
                copied += n as u64;
            }
            _ = idle => {
                if !frames.at_boundary() {
                    debug!("Holding keepalive ping, client frame still in flight");
                    continue;
                }
                if let Some(frame) = keepalive.frame().encode(pings) {
                    pings = pings.wrapping_add(1);
                    let sent = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    };
                    match sent.await {
                        Ok(()) => debug!("Sent {:?} keepalive ping #{}", keepalive.frame(), pings),
                        Err(e) => warn!("Keepalive ping failed: {}", e),
                    }
                }
            }
        }
    }
}
