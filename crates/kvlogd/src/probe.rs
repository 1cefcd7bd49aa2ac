//! One-shot HTTP health probe, for container health checks.

use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use http::{StatusCode, Uri};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tracing::debug;

/// GET `url` once. `Ok(true)` on a 2xx answer; connection failures,
/// non-2xx answers and timeouts are `Ok(false)`. A URL that cannot be
/// probed is an error.
pub async fn probe(url: &str, timeout: Duration) -> anyhow::Result<bool> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("invalid probe url {url:?}"))?;
    if uri.scheme_str() != Some("http") {
        bail!("probe url must be http://, got {url:?}");
    }
    let Some(authority) = uri.authority() else {
        bail!("probe url has no host: {url:?}");
    };
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
    let path = uri.path_and_query().map_or("/", |p| p.as_str());

    match tokio::time::timeout(timeout, get(&address, authority.as_str(), path)).await {
        Ok(Ok(status)) if status.is_success() => {
            debug!(%status, %url, "probe succeeded");
            Ok(true)
        }
        Ok(Ok(status)) => {
            debug!(%status, %url, "probe non-2xx");
            Ok(false)
        }
        Ok(Err(e)) => {
            debug!(error = %e, %url, "probe request failed");
            Ok(false)
        }
        Err(_) => {
            debug!(%url, "probe timed out");
            Ok(false)
        }
    }
}

async fn get(address: &str, host: &str, path: &str) -> anyhow::Result<StatusCode> {
    let stream = tokio::net::TcpStream::connect(address).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("connection", "close")
        .header("user-agent", concat!("kvlogd-probe/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())?;

    Ok(sender.send_request(req).await?.status())
}
