//! TCP transport glue.
//!
//! Produces connected byte streams and hands them to the connection core
//! with endpoint labels filled in from socket addresses. The core itself
//! never opens sockets; anything implementing `AsyncRead + AsyncWrite`
//! works, this module is just the conventional TCP pairing.

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::connection::{Connection, ConnectionBuilder};
use crate::error::Result;

/// Accepts TCP connections and wraps each in a server-role [`Connection`].
pub struct EpoxyListener {
    listener: TcpListener,
}

impl EpoxyListener {
    /// Bind to a local address.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection, configured by `builder`.
    ///
    /// The returned connection is not yet started; the caller drives
    /// `start()` (typically in a spawned task per connection).
    pub async fn accept(&self, builder: ConnectionBuilder) -> Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local = self.listener.local_addr()?;
        Ok(builder
            .endpoints(local.to_string(), peer.to_string())
            .server(stream))
    }
}

/// Connect to a remote listener and wrap the stream in a client-role
/// [`Connection`].
pub async fn connect(addr: impl ToSocketAddrs, builder: ConnectionBuilder) -> Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    let peer = stream.peer_addr()?;
    Ok(builder
        .endpoints(local.to_string(), peer.to_string())
        .client(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_connect_accept_pairs_endpoints() {
        let listener = EpoxyListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, server) = tokio::join!(
            connect(addr, ConnectionBuilder::new()),
            listener.accept(ConnectionBuilder::new()),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        let client_metrics = client.metrics();
        let server_metrics = server.metrics();

        assert_eq!(client_metrics.remote_endpoint, addr.to_string());
        assert_eq!(server_metrics.local_endpoint, addr.to_string());
        assert_eq!(
            client_metrics.local_endpoint,
            server_metrics.remote_endpoint
        );
    }
}
