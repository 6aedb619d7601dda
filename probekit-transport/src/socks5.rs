use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use probekit_common::{Failure, FailureKind};
use probekit_wire::socks5::{Codec, Message};
use tokio_util::codec::Framed;

use crate::Io;

/// Runs the client side of the SOCKS5 handshake on `io`, asking the proxy
/// to connect to `host:port`. Returns the stream together with any bytes
/// read past the proxy reply, which belong to the next layer.
pub(crate) async fn handshake(
    io: Box<dyn Io>,
    host: &str,
    port: i64,
) -> Result<(Box<dyn Io>, Bytes), Failure> {
    let mut framed = Framed::new(io, Codec::new());

    tracing::debug!(host, port, "socks5: sending greeting");
    framed.send(Message::AuthRequest).await.map_err(Failure::from)?;
    let reply = framed.next().await.ok_or_else(eof)?.map_err(Failure::from)?;
    if !matches!(reply, Message::AuthReply { .. }) {
        return Err(Failure::with_reason(FailureKind::Socks, "unexpected proxy message"));
    }

    tracing::debug!("socks5: sending connect request");
    framed
        .send(Message::ConnectRequest { host: host.to_string(), port })
        .await
        .map_err(Failure::from)?;
    let reply = framed.next().await.ok_or_else(eof)?.map_err(Failure::from)?;
    if let Message::ConnectReply { bound } = reply {
        tracing::debug!(?bound, "socks5: connected through proxy");
    }

    let parts = framed.into_parts();
    Ok((parts.io, parts.read_buf.freeze()))
}

fn eof() -> Failure {
    Failure::with_reason(FailureKind::Eof, "proxy closed the connection mid-handshake")
}
