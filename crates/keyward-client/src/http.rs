//! HTTP key directory client.
//!
//! JSON over HTTPS with a bearer token. Binary fields are base64.
//!
//! | operation        | request                                   |
//! |------------------|-------------------------------------------|
//! | upload keys      | `PUT pfs/v2/keys`                         |
//! | validate keys    | `POST pfs/v2/keys/actions/validate`       |
//! | fetch one set    | `POST pfs/v2/keys/actions/pick-one`       |
//! | fetch many sets  | `POST pfs/v2/keys/actions/pick-batch`     |
//! | delete keys      | `DELETE pfs/v2/keys`                      |

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use keyward_crypto::{KEY_LEN, KeyId};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::directory::{
    DirectoryError, KeyBundle, KeyUpload, RemoteKeyDirectory, SignedPublicKey, UsedKeys,
};

/// Longest response body kept in `DirectoryError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Directory client over HTTP.
#[derive(Clone)]
pub struct HttpKeyDirectory {
    client: Client,
    base: Url,
    token: String,
}

impl HttpKeyDirectory {
    /// Client for the directory at `base`, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// - `Network` if `base` is not a valid URL or the HTTP client cannot be
    ///   built
    pub fn new(base: &str, token: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .user_agent(concat!("keyward/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DirectoryError::Network(e.to_string()))?;
        Self::with_client(client, base, token)
    }

    /// Client reusing an existing `reqwest::Client`.
    pub fn with_client(
        client: Client,
        base: &str,
        token: impl Into<String>,
    ) -> Result<Self, DirectoryError> {
        let mut base =
            Url::parse(base).map_err(|e| DirectoryError::Network(format!("invalid url: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base, token: token.into() })
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, DirectoryError> {
        let url = self.base.join(path).map_err(|e| DirectoryError::Network(e.to_string()))?;
        let mut request = self.client.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| DirectoryError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DirectoryError::Status { code: status.as_u16(), body: truncate_body(&body) })
    }

    async fn call<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<R, DirectoryError> {
        let response = self.send(method, path, Some(body)).await?;
        response.json().await.map_err(|e| DirectoryError::Serialization(e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct SignedKeyJson {
    public_key: String,
    signature: String,
}

#[derive(Serialize)]
struct UploadJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    identity_card_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    long_term_key: Option<SignedKeyJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    one_time_keys: Vec<String>,
}

#[derive(Serialize)]
struct ValidateJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    long_term_key_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    one_time_keys_ids: Vec<String>,
}

#[derive(Deserialize)]
struct UsedKeysJson {
    used_long_term_key_id: Option<String>,
    #[serde(default)]
    used_one_time_keys_ids: Vec<String>,
}

#[derive(Deserialize)]
struct BundleJson {
    /// Only present in batch responses
    identity: Option<String>,
    identity_key: String,
    long_term_key: SignedKeyJson,
    one_time_key: Option<String>,
}

#[derive(Serialize)]
struct PickOneJson<'a> {
    identity: &'a str,
}

#[derive(Serialize)]
struct PickBatchJson<'a> {
    identities: &'a [String],
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>, DirectoryError> {
    STANDARD
        .decode(value)
        .map_err(|e| DirectoryError::Serialization(format!("{field}: {e}")))
}

fn decode_key(field: &str, value: &str) -> Result<[u8; KEY_LEN], DirectoryError> {
    let bytes = decode(field, value)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        let got = bytes.len();
        DirectoryError::Serialization(format!("{field}: expected {KEY_LEN} bytes, got {got}"))
    })
}

fn decode_key_id(value: &str) -> Result<KeyId, DirectoryError> {
    KeyId::from_slice(&decode("key id", value)?)
        .map_err(|e| DirectoryError::Serialization(format!("key id: {e}")))
}

impl SignedKeyJson {
    fn encode(key: &SignedPublicKey) -> Self {
        Self {
            public_key: STANDARD.encode(key.public_key),
            signature: STANDARD.encode(&key.signature),
        }
    }

    fn decode(&self) -> Result<SignedPublicKey, DirectoryError> {
        Ok(SignedPublicKey {
            public_key: decode_key("long_term_key.public_key", &self.public_key)?,
            signature: decode("long_term_key.signature", &self.signature)?,
        })
    }
}

impl BundleJson {
    fn into_bundle(self, fallback_identity: &str) -> Result<KeyBundle, DirectoryError> {
        Ok(KeyBundle {
            identity: self.identity.unwrap_or_else(|| fallback_identity.to_string()),
            identity_public_key: decode("identity_key", &self.identity_key)?,
            long_term_public_key: self.long_term_key.decode()?,
            one_time_public_key: self
                .one_time_key
                .as_deref()
                .map(|key| decode_key("one_time_key", key))
                .transpose()?,
        })
    }
}

#[async_trait]
impl RemoteKeyDirectory for HttpKeyDirectory {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<(), DirectoryError> {
        let body = UploadJson {
            identity_card_id: upload.identity_card_id,
            long_term_key: upload.long_term_public_key.as_ref().map(SignedKeyJson::encode),
            one_time_keys: upload
                .one_time_public_keys
                .iter()
                .map(|key| STANDARD.encode(key))
                .collect(),
        };
        self.send(Method::PUT, "pfs/v2/keys", Some(&body)).await?;
        Ok(())
    }

    async fn validate_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<UsedKeys, DirectoryError> {
        if long_term_key_id.is_none() && one_time_key_ids.is_empty() {
            return Ok(UsedKeys::default());
        }

        let body = ValidateJson {
            long_term_key_id: long_term_key_id.map(|id| STANDARD.encode(id.as_bytes())),
            one_time_keys_ids: one_time_key_ids
                .iter()
                .map(|id| STANDARD.encode(id.as_bytes()))
                .collect(),
        };
        let used: UsedKeysJson =
            self.call(Method::POST, "pfs/v2/keys/actions/validate", &body).await?;

        Ok(UsedKeys {
            used_long_term_key_id: used
                .used_long_term_key_id
                .as_deref()
                .map(decode_key_id)
                .transpose()?,
            used_one_time_key_ids: used
                .used_one_time_keys_ids
                .iter()
                .map(|id| decode_key_id(id))
                .collect::<Result<_, _>>()?,
        })
    }

    async fn fetch_key_set(&self, identity: &str) -> Result<KeyBundle, DirectoryError> {
        let body = PickOneJson { identity };
        let bundle: BundleJson = self
            .call(Method::POST, "pfs/v2/keys/actions/pick-one", &body)
            .await
            .map_err(|e| match e {
                DirectoryError::Status { code, .. } if code == StatusCode::NOT_FOUND.as_u16() => {
                    DirectoryError::NotFound { identity: identity.to_string() }
                },
                other => other,
            })?;
        bundle.into_bundle(identity)
    }

    async fn fetch_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<KeyBundle>, DirectoryError> {
        let body = PickBatchJson { identities };
        let bundles: Vec<BundleJson> =
            self.call(Method::POST, "pfs/v2/keys/actions/pick-batch", &body).await?;
        bundles.into_iter().map(|bundle| bundle.into_bundle("")).collect()
    }

    async fn delete_keys(&self) -> Result<(), DirectoryError> {
        self.send::<()>(Method::DELETE, "pfs/v2/keys", None).await?;
        Ok(())
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// Answer one request with `status` and `body`; returns the raw request.
    async fn spawn_mock_directory(
        status: &'static str,
        body: String,
    ) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let mut request = Vec::new();
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0_u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    request.extend_from_slice(&buf[..n]);
                    if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                        let length = head
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|value| value.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
            String::from_utf8_lossy(&request).into_owned()
        });
        (addr, handle)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_key_set_decodes_bundle() {
        let body = serde_json::json!({
            "identity_key": STANDARD.encode([1u8; 32]),
            "long_term_key": {
                "public_key": STANDARD.encode([2u8; 32]),
                "signature": STANDARD.encode([3u8; 64]),
            },
            "one_time_key": STANDARD.encode([4u8; 32]),
        })
        .to_string();
        let (addr, handle) = spawn_mock_directory("200 OK", body).await;
        let directory =
            HttpKeyDirectory::new(&format!("http://{addr}/"), "secret").expect("client");

        let bundle = directory.fetch_key_set("alice").await.expect("fetch");
        assert_eq!(bundle.identity, "alice");
        assert_eq!(bundle.long_term_public_key.public_key, [2u8; 32]);
        assert_eq!(bundle.one_time_public_key, Some([4u8; 32]));

        let request = handle.await.expect("server");
        assert!(request.starts_with("POST /pfs/v2/keys/actions/pick-one"));
        assert!(request.to_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains(r#"{"identity":"alice"}"#));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn not_found_status_maps_to_not_found() {
        let (addr, handle) = spawn_mock_directory("404 Not Found", "{}".to_string()).await;
        let directory = HttpKeyDirectory::new(&format!("http://{addr}"), "t").expect("client");

        let err = directory.fetch_key_set("bob").await.expect_err("missing");
        assert_eq!(err, DirectoryError::NotFound { identity: "bob".into() });
        handle.await.expect("server");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_bodies_are_truncated() {
        let (addr, handle) =
            spawn_mock_directory("503 Service Unavailable", "x".repeat(2048)).await;
        let directory = HttpKeyDirectory::new(&format!("http://{addr}"), "t").expect("client");

        match directory.delete_keys().await {
            Err(DirectoryError::Status { code, body }) => {
                assert_eq!(code, 503);
                assert!(body.len() <= MAX_ERROR_BODY + '…'.len_utf8());
            },
            other => panic!("unexpected result: {other:?}"),
        }
        handle.await.expect("server");
    }

    #[tokio::test]
    async fn empty_validation_sends_nothing() {
        let directory = HttpKeyDirectory::new("http://127.0.0.1:9/", "t").expect("client");
        assert_eq!(directory.validate_keys(None, &[]).await, Ok(UsedKeys::default()));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate_body(&body);
        assert!(truncated.ends_with('…'));
        assert!(truncated.len() <= MAX_ERROR_BODY + '…'.len_utf8());
    }
}
