//! Line-framed serial transport with a single FIFO mutex (spec.md §4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::TransportError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_POST_DELAY: Duration = Duration::from_millis(50);

/// A byte-oriented duplex link: a serial port in production, an in-memory
/// duplex pipe in tests. `bench-test-support::MockTransport` implements this
/// over a channel pair so session tests never touch real I/O.
pub trait LineLink: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineLink for T {}

struct Inner {
    link: Box<dyn LineLink>,
    read_buf: Vec<u8>,
}

/// Serializes command/response pairs over a single link (spec.md §4.1).
///
/// Every `write`/`query` acquires the internal mutex, performs I/O plus the
/// post-command delay, then releases. Calls are not reentrant: a caller that
/// tries to issue a second operation from within the first will deadlock,
/// same as acquiring any other non-reentrant lock twice.
pub struct Transport {
    inner: Mutex<Inner>,
    disconnected: AtomicBool,
    timeout: Duration,
    post_delay: Duration,
}

impl Transport {
    pub fn new(link: impl LineLink + 'static) -> Self {
        Transport {
            inner: Mutex::new(Inner {
                link: Box::new(link),
                read_buf: Vec::new(),
            }),
            disconnected: AtomicBool::new(false),
            timeout: DEFAULT_TIMEOUT,
            post_delay: DEFAULT_POST_DELAY,
        }
    }

    pub fn with_timing(mut self, timeout: Duration, post_delay: Duration) -> Self {
        self.timeout = timeout;
        self.post_delay = post_delay;
        self
    }

    pub fn is_open(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    /// Latch the disconnected state. Idempotent; all subsequent operations
    /// fail fast with `TransportError::Disconnected` without touching the
    /// link again.
    pub fn close(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    fn fail_fast(&self) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected {
                cause: "transport previously closed".to_owned(),
            });
        }
        Ok(())
    }

    /// Write `cmd` followed by a newline; returns once the bytes are
    /// enqueued and the post-command delay has elapsed.
    pub async fn write(&self, cmd: &str) -> Result<(), TransportError> {
        self.fail_fast()?;
        let mut guard = self.inner.lock().await;
        let result = write_line(&mut guard.link, cmd).await;
        self.finish(result).await
    }

    /// Write `cmd`, then await one newline-terminated reply line, bounded by
    /// the configured timeout. Serialized against every other transport call
    /// through the same mutex acquisition, so no other caller's write can
    /// land between this write and its matching read.
    pub async fn query(&self, cmd: &str) -> Result<String, TransportError> {
        self.fail_fast()?;
        let mut guard = self.inner.lock().await;
        let Inner { link, read_buf } = &mut *guard;
        let op = async {
            write_line(link, cmd).await?;
            read_line(link, read_buf).await
        };
        let result = timeout(self.timeout, op)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?;
        self.finish(result).await
    }

    async fn finish<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        match result {
            Ok(value) => {
                tokio::time::sleep(self.post_delay).await;
                Ok(value)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }
}

async fn write_line(link: &mut Box<dyn LineLink>, cmd: &str) -> Result<(), TransportError> {
    link.write_all(cmd.as_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    link.write_all(b"\n").await.map_err(|e| TransportError::Io(e.to_string()))?;
    link.flush().await.map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

async fn read_line(link: &mut Box<dyn LineLink>, buf: &mut Vec<u8>) -> Result<String, TransportError> {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            return Ok(text);
        }
        let mut chunk = [0u8; 256];
        let n = link
            .read(&mut chunk)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::Io("link closed before newline".to_owned()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub type SharedTransport = Arc<Transport>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn query_round_trips_over_duplex_link() {
        let (client, mut server) = duplex(256);
        let transport = Transport::new(client).with_timing(Duration::from_millis(200), Duration::from_millis(0));

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            server.write_all(b"Acme,PSU-1,SN1\n").await.unwrap();
        });

        let reply = transport.query("*IDN?").await.unwrap();
        assert_eq!(reply, "Acme,PSU-1,SN1");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_transport_fails_fast() {
        let (client, _server) = duplex(256);
        let transport = Transport::new(client);
        transport.close();
        let result = transport.query("*IDN?").await;
        assert!(matches!(result, Err(TransportError::Disconnected { .. })));
    }

    #[tokio::test]
    async fn io_error_latches_disconnected() {
        let (client, server) = duplex(256);
        drop(server);
        let transport = Transport::new(client).with_timing(Duration::from_millis(100), Duration::from_millis(0));
        let result = transport.query("*IDN?").await;
        assert!(result.is_err());
        assert!(!transport.is_open());
    }
}
