//! `/ping/1.0.0`: any payload of up to 64 bytes is answered with `pong`.

use std::io;
use std::time::{Duration, Instant};

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt};
use libp2p::StreamProtocol;
use libp2p_stream::IncomingStreams;
use tracing::debug;

pub const PING_PROTOCOL: StreamProtocol = StreamProtocol::new("/ping/1.0.0");

const MAX_PING_BYTES: usize = 64;
const PONG: &[u8] = b"pong";

/// Answer a single ping on `stream` and close our side.
pub async fn answer<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; MAX_PING_BYTES];
    let n = stream.read(&mut buf).await?;
    debug!("ping with {} byte payload", n);

    stream.write_all(PONG).await?;
    stream.flush().await?;
    stream.close().await
}

/// Send a ping and measure the time until the full `pong` came back.
pub async fn measure<S>(stream: &mut S) -> io::Result<Duration>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    stream.write_all(b"ping").await?;
    stream.flush().await?;

    let mut reply = Vec::with_capacity(PONG.len());
    stream
        .take(MAX_PING_BYTES as u64)
        .read_to_end(&mut reply)
        .await?;
    if reply != PONG {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected ping reply ({} bytes)", reply.len()),
        ));
    }

    Ok(started.elapsed())
}

/// Answer every incoming ping stream until the registration is dropped.
pub async fn serve(mut incoming: IncomingStreams) {
    while let Some((peer, mut stream)) = incoming.next().await {
        tokio::spawn(async move {
            if let Err(e) = answer(&mut stream).await {
                debug!("ping from {} failed: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    #[tokio::test]
    async fn test_answer_replies_pong() {
        let mut stream = Cursor::new(b"ping".to_vec());
        answer(&mut stream).await.unwrap();
        assert_eq!(stream.into_inner(), b"pingpong");
    }

    #[tokio::test]
    async fn test_answer_reads_at_most_64_bytes() {
        let mut stream = Cursor::new(vec![b'x'; 100]);
        answer(&mut stream).await.unwrap();

        let written = stream.into_inner();
        assert_eq!(&written[64..68], PONG);
        assert_eq!(written.len(), 100);
    }

    #[tokio::test]
    async fn test_measure_against_answer() {
        let (client, server) = tokio::io::duplex(256);

        let responder = tokio::spawn(async move {
            let mut server = server.compat();
            answer(&mut server).await.unwrap();
        });

        let mut client = client.compat();
        let rtt = measure(&mut client).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_measure_rejects_wrong_reply() {
        let (client, server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut server = server.compat();
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(b"nope").await.unwrap();
            server.close().await.unwrap();
        });

        let mut client = client.compat();
        let err = measure(&mut client).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
