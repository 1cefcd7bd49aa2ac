//! Schema registry lookup for wire-format framing detection.
//!
//! Producers that serialize through a schema registry prefix every key or
//! value with a 5-byte frame (magic byte plus schema id). Whether a topic's
//! keys or values are framed is decided once at startup by checking for the
//! `{topic}-key` and `{topic}-value` subjects.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use tracing::{debug, error, info};

use crate::error::{BrokerError, BrokerResult};

/// Width of the schema frame in front of a serialized key or value.
pub const FRAME_LEN: usize = 5;

/// Subject listing.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn subjects(&self) -> BrokerResult<Vec<String>>;
}

/// Which parts of a topic's records carry the schema frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Framing {
    pub key: bool,
    pub value: bool,
}

/// Look up framing for `topic`. No registry, or a failing one, means
/// unframed.
pub async fn detect_framing(registry: Option<&dyn SchemaRegistry>, topic: &str) -> Framing {
    let Some(registry) = registry else {
        return Framing::default();
    };
    match registry.subjects().await {
        Ok(subjects) => {
            let framing = Framing {
                key: subjects.iter().any(|s| *s == format!("{topic}-key")),
                value: subjects.iter().any(|s| *s == format!("{topic}-value")),
            };
            info!(%topic, key = framing.key, value = framing.value, "schema framing detected");
            framing
        }
        Err(e) => {
            error!(%topic, error = %e, "schema registry lookup failed, assuming unframed records");
            Framing::default()
        }
    }
}

/// Registry client speaking plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpSchemaRegistry {
    authority: String,
    subjects_path: String,
    timeout: Duration,
}

impl HttpSchemaRegistry {
    /// `base_url` is e.g. `http://registry:8081` or `http://host/prefix`.
    pub fn new(base_url: &str, timeout: Duration) -> BrokerResult<Self> {
        let uri: http::Uri = base_url
            .parse()
            .map_err(|e| BrokerError::Config(format!("schema registry url {base_url:?}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(BrokerError::Config(format!(
                "schema registry url {base_url:?}: only http:// is supported"
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| BrokerError::Config(format!("schema registry url {base_url:?} has no host")))?;
        let authority = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        let subjects_path = format!("{}/subjects", uri.path().trim_end_matches('/'));
        Ok(Self {
            authority,
            subjects_path,
            timeout,
        })
    }

    async fn get(&self, path: &str) -> BrokerResult<Bytes> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| BrokerError::SchemaRegistry(format!("connect {}: {e}", self.authority)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| BrokerError::SchemaRegistry(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "schema registry connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", &self.authority)
            .header("accept", "application/vnd.schemaregistry.v1+json, application/json")
            .header("user-agent", "kvlog/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| BrokerError::SchemaRegistry(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| BrokerError::SchemaRegistry(format!("request: {e}")))?;
        if !resp.status().is_success() {
            return Err(BrokerError::SchemaRegistry(format!(
                "GET {path} answered {}",
                resp.status()
            )));
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| BrokerError::SchemaRegistry(format!("body: {e}")))?;
        Ok(body.to_bytes())
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn subjects(&self) -> BrokerResult<Vec<String>> {
        let body = tokio::time::timeout(self.timeout, self.get(&self.subjects_path))
            .await
            .map_err(|_| BrokerError::SchemaRegistry("request timed out".to_string()))??;
        serde_json::from_slice(&body)
            .map_err(|e| BrokerError::SchemaRegistry(format!("unexpected subjects payload: {e}")))
    }
}

/// Drop the schema frame from a key or value.
pub fn strip_frame(payload: &[u8]) -> Option<&[u8]> {
    payload.get(FRAME_LEN..)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(BrokerResult<Vec<String>>);

    #[async_trait]
    impl SchemaRegistry for Fixed {
        async fn subjects(&self) -> BrokerResult<Vec<String>> {
            match &self.0 {
                Ok(subjects) => Ok(subjects.clone()),
                Err(e) => Err(BrokerError::SchemaRegistry(e.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn no_registry_means_unframed() {
        assert_eq!(detect_framing(None, "kv").await, Framing::default());
    }

    #[tokio::test]
    async fn subjects_select_key_and_value() {
        let registry = Fixed(Ok(vec!["kv-value".to_string(), "other-key".to_string()]));
        let framing = detect_framing(Some(&registry), "kv").await;
        assert_eq!(framing, Framing { key: false, value: true });
    }

    #[tokio::test]
    async fn registry_failure_means_unframed() {
        let registry = Fixed(Err(BrokerError::SchemaRegistry("down".to_string())));
        assert_eq!(detect_framing(Some(&registry), "kv").await, Framing::default());
    }

    #[test]
    fn url_parsing() {
        let registry = HttpSchemaRegistry::new("http://registry:8081/", Duration::from_secs(1)).unwrap();
        assert_eq!(registry.authority, "registry:8081");
        assert_eq!(registry.subjects_path, "/subjects");

        let registry = HttpSchemaRegistry::new("http://host/prefix", Duration::from_secs(1)).unwrap();
        assert_eq!(registry.authority, "host:80");
        assert_eq!(registry.subjects_path, "/prefix/subjects");

        assert!(HttpSchemaRegistry::new("https://host", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn frame_stripping() {
        assert_eq!(strip_frame(&[0, 0, 0, 0, 1, b'a']), Some(&b"a"[..]));
        assert_eq!(strip_frame(&[0, 0, 0, 0, 1]), Some(&b""[..]));
        assert_eq!(strip_frame(&[0, 0, 1]), None);
    }

    #[tokio::test]
    async fn subjects_over_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = r#"["kv-key","kv-value"]"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
        });

        let registry = HttpSchemaRegistry::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
        let framing = detect_framing(Some(&registry), "kv").await;
        assert_eq!(framing, Framing { key: true, value: true });
    }
}
