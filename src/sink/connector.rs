//! Outbound connections for the stream sink.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

/// Byte stream the sink writes access units into.
pub trait SinkStream: AsyncWrite + Unpin + Send {}

impl<T: AsyncWrite + Unpin + Send> SinkStream for T {}

pub type BoxedStream = Box<dyn SinkStream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// Opens a fresh stream each time the sink (re)connects.
pub trait Connector: Send + Sync {
    fn describe(&self) -> String;

    fn connect(&self) -> ConnectFuture<'_>;
}

/// TCP client to the downstream ingest.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
