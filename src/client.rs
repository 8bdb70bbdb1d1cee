//! Client side of the command channel.
//!
//! A [`Client`] opens a fresh TCP connection per request, retrying until
//! the connect timeout elapses, writes one encrypted frame and closes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, instrument, warn};

use crate::error::ChannelError;
use crate::transport::{FrameCodec, Request, Response};

/// Connection retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Total time spent retrying before giving up with `ConnectTimeout`.
    pub connect_timeout: Duration,

    /// Pause between failed connection attempts.
    pub retry_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// Sends requests to a server at a fixed address.
#[derive(Debug, Clone)]
pub struct Client {
    addr: SocketAddr,
    codec: FrameCodec,
    options: ClientOptions,
}

impl Client {
    pub fn new(addr: SocketAddr, codec: FrameCodec) -> Self {
        Self {
            addr,
            codec,
            options: ClientOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connect to the server, retrying until `connect_timeout` has elapsed.
    pub async fn connect(&self) -> Result<TcpStream, ChannelError> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let remaining = self.options.connect_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(addr = %self.addr, attempts, "Connect timeout reached");
                return Err(ChannelError::ConnectTimeout {
                    addr: self.addr,
                    elapsed: started.elapsed(),
                });
            }

            let socket = open_socket(self.addr)?;
            match tokio::time::timeout(remaining, socket.connect(self.addr)).await {
                Ok(Ok(stream)) => {
                    info!(addr = %self.addr, attempts, "Connection established");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(addr = %self.addr, attempt = attempts, error = %e, "Connect failed, retrying");
                }
                Err(_) => {
                    debug!(addr = %self.addr, attempt = attempts, "Connect attempt timed out");
                }
            }

            let remaining = self.options.connect_timeout.saturating_sub(started.elapsed());
            tokio::time::sleep(self.options.retry_interval.min(remaining)).await;
        }
    }

    /// Send one request and close the connection without waiting for a reply.
    ///
    /// Success only means the frame was written; the command outcome is not observed.
    #[instrument(skip(self, request), fields(addr = %self.addr, id = %request.id))]
    pub async fn send_request(&self, request: &Request) -> Result<usize, ChannelError> {
        let mut stream = self.connect().await?;
        let written = self.codec.write(&mut stream, request).await?;
        info!(bytes = written, "Request sent");

        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Error closing connection");
        }
        Ok(written)
    }

    /// Send one request and wait for the server's response frame.
    #[instrument(skip(self, request), fields(addr = %self.addr, id = %request.id))]
    pub async fn request(&self, request: &Request) -> Result<Response, ChannelError> {
        let mut stream = self.connect().await?;
        let written = self.codec.write(&mut stream, request).await?;
        debug!(bytes = written, "Request sent, awaiting response");

        let response: Response = self.codec.decode(&mut stream).await?;
        if response.request_id != request.id {
            warn!(expected = %request.id, got = %response.request_id, "Response id mismatch");
        }

        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Error closing connection");
        }
        Ok(response)
    }
}

fn open_socket(addr: SocketAddr) -> Result<TcpSocket, ChannelError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(ChannelError::Connection)?;

    socket.set_reuseaddr(true).map_err(ChannelError::Connection)?;
    socket.set_keepalive(true).map_err(ChannelError::Connection)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::cipher::KEY_SIZE;
    use crate::transport::{CommandKind, SharedKey};
    use tokio::net::TcpListener;

    fn codec() -> FrameCodec {
        FrameCodec::with_key(&SharedKey::new([3u8; KEY_SIZE]))
    }

    /// An address nothing is listening on (bound then released).
    fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn connect_times_out_without_listener() {
        let addr = unused_addr();
        let client = Client::new(addr, codec()).with_options(ClientOptions {
            connect_timeout: Duration::from_millis(300),
            retry_interval: Duration::from_millis(50),
        });

        let started = Instant::now();
        let err = client
            .send_request(&Request::new(CommandKind::Info, "a", "t"))
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::ConnectTimeout { .. }), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn connect_succeeds_once_listener_appears() {
        let addr = unused_addr();
        let codec = codec();

        let server_codec = codec.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            server_codec.decode::<Request, _>(&mut stream).await.unwrap()
        });

        let client = Client::new(addr, codec).with_options(ClientOptions {
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
        });
        let req = Request::new(CommandKind::Info, "late", "t");
        client.send_request(&req).await.unwrap();

        assert_eq!(server.await.unwrap(), req);
    }

    #[tokio::test]
    async fn request_reads_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let codec = codec();

        let server_codec = codec.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: Request = server_codec.decode(&mut stream).await.unwrap();
            let mut resp = Response::for_request("srv", &req);
            resp.attributes.insert("ok".into(), "true".into());
            server_codec.write(&mut stream, &resp).await.unwrap();
        });

        let resp = Client::new(addr, codec)
            .request(&Request::new(CommandKind::Info, "abc", "t"))
            .await
            .unwrap();
        assert_eq!(resp.request_id, "abc");
        assert_eq!(resp.attributes["ok"], "true");
    }
}
