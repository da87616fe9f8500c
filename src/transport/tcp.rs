use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransportError;

use super::Transport;

/// Raw TCP transport for console servers.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect(format!("{peer}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!("{} TCP connection successful", peer);
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            debug!("{} closing TCP stream", self.peer);
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_writes_and_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            socket.write_all(b"sw1>").await.expect("greet");
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.expect("read");
            buf[..n].to_vec()
        });

        let mut transport = TcpTransport::connect("127.0.0.1", addr.port())
            .await
            .expect("connect");
        let greeting = transport
            .read(64, Duration::from_secs(5))
            .await
            .expect("greeting");
        assert_eq!(greeting, b"sw1>");
        transport.write(b"show clock\r\n").await.expect("write");

        let received = server.await.expect("server task");
        assert_eq!(received, b"show clock\r\n");

        let err = transport
            .read(64, Duration::from_secs(5))
            .await
            .expect_err("peer closed");
        assert!(matches!(err, TransportError::Closed));

        transport.close().await.expect("close");
        let err = transport.write(b"x").await.expect_err("closed");
        assert!(matches!(err, TransportError::Closed));
    }
}
