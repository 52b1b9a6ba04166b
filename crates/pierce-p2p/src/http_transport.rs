//! HTTP/1.1 carried over `/http/1.1` libp2p streams.
//!
//! The serving side hands each stream to hyper with an [`axum::Router`] as the
//! service; the calling side drives a hyper client connection on the stream.

use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use libp2p::StreamProtocol;
use libp2p_stream::IncomingStreams;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

pub const HTTP_PROTOCOL: StreamProtocol = StreamProtocol::new("/http/1.1");

/// Serve `router` on every incoming stream until the registration is dropped.
pub async fn serve(mut incoming: IncomingStreams, router: Router) {
    while let Some((peer, stream)) = incoming.next().await {
        let router = router.clone();
        tokio::spawn(async move {
            debug!("http stream opened by {}", peer);
            if let Err(e) = serve_connection(stream.compat(), router).await {
                debug!("http stream from {} ended with error: {}", peer, e);
            }
        });
    }
}

/// Run one HTTP/1.1 server connection over `io`.
pub async fn serve_connection<T>(io: T, router: Router) -> Result<(), hyper::Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(router))
        .await
}

/// Send one request over `io` and collect the whole response body.
pub async fn send_request<T>(
    io: T,
    request: Request<Full<Bytes>>,
) -> Result<Response<Bytes>, hyper::Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("http client connection ended with error: {}", e);
        }
    });

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use hyper::{Method, StatusCode};

    fn router() -> Router {
        Router::new()
            .route("/data", get(|| async { "hello over a stream" }))
            .route("/echo", post(|body: String| async move { body }))
    }

    async fn roundtrip(request: Request<Full<Bytes>>) -> Response<Bytes> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(server, router()));
        send_request(client, request).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_is_routed() {
        let request = Request::builder()
            .uri("/data")
            .header(hyper::header::HOST, "peer")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = roundtrip(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"hello over a stream");
    }

    #[tokio::test]
    async fn test_post_body_reaches_handler() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header(hyper::header::HOST, "peer")
            .body(Full::new(Bytes::from_static(b"{\"n\":1}")))
            .unwrap();

        let response = roundtrip(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"{\"n\":1}");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let request = Request::builder()
            .uri("/missing")
            .header(hyper::header::HOST, "peer")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = roundtrip(request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
