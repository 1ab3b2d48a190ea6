use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::client::{UpstreamBody, UpstreamClient, UpstreamRequest};
use crate::error::{ErrorKind, ProxyError};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Refresh this long before the hour-long token actually expires.
const EXPIRY_SLACK: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

/// Exchanges a service-account key for short-lived OAuth access tokens,
/// cached per credential hash until near expiry.
pub struct GcpTokenBroker {
    client: Arc<dyn UpstreamClient>,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl GcpTokenBroker {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn access_token(
        &self,
        key_hash: &str,
        client_email: &str,
        private_key: &str,
    ) -> Result<String, ProxyError> {
        {
            let cache = self.cache.lock().await;
            if let Some(token) = cache.get(key_hash)
                && token.expires_at > SystemTime::now() + EXPIRY_SLACK
            {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.exchange(client_email, private_key).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(key_hash.to_string(), token.clone());
        Ok(token.access_token)
    }

    async fn exchange(
        &self,
        client_email: &str,
        private_key: &str,
    ) -> Result<CachedToken, ProxyError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ProxyError::internal("system clock before epoch"))?
            .as_secs();
        let claims = Claims {
            iss: client_email,
            scope: SCOPE,
            aud: TOKEN_URL,
            iat: now,
            exp: now + 3600,
        };
        // Env-sourced keys often carry literal \n sequences.
        let pem = private_key.replace("\\n", "\n");
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|err| ProxyError::internal(format!("gcp private key: {err}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|err| ProxyError::internal(format!("gcp jwt: {err}")))?;

        let form = format!(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion={assertion}"
        );
        let response = self
            .client
            .send(UpstreamRequest {
                url: TOKEN_URL.to_string(),
                headers: vec![(
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                )],
                body: Bytes::from(form),
                want_stream: false,
            })
            .await
            .map_err(|err| {
                ProxyError::new(ErrorKind::UpstreamUnavailable, format!("gcp token: {err}"))
            })?;

        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => {
                return Err(ProxyError::internal("gcp token endpoint streamed"));
            }
        };
        if !(200..300).contains(&response.status) {
            return Err(ProxyError::new(
                ErrorKind::UpstreamUnavailable,
                format!("gcp token exchange failed: {}", response.status),
            ));
        }
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| ProxyError::internal(format!("gcp token body: {err}")))?;
        let lifetime = if parsed.expires_in == 0 {
            3600
        } else {
            parsed.expires_in
        };
        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: SystemTime::now() + Duration::from_secs(lifetime),
        })
    }
}
