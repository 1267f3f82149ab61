use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use shared::{domain::TokenSlot, error::ErrorBody};
use storage::CredentialStore;
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult},
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    token: Option<String>,
}

/// One logical call, kept around so it can be replayed after a refresh.
struct PendingCall {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

/// Authenticated JSON client for the chat gateway.
///
/// A 401 triggers exactly one refresh of the access credential followed by
/// exactly one retry. If the refresh fails the credential store is cleared and
/// the call fails with [`ClientError::AuthExpired`]; a second 401 fails with
/// [`ClientError::Unauthorized`].
pub struct GatewayClient {
    http: Client,
    base_url: String,
    refresh_path: String,
    credentials: Arc<dyn CredentialStore>,
}

impl GatewayClient {
    pub fn new(
        settings: &ClientSettings,
        credentials: Arc<dyn CredentialStore>,
    ) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| ClientError::Config(format!("cannot build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            refresh_path: settings.refresh_path.clone(),
            credentials,
        })
    }

    /// `Ok(None)` when the server answered 2xx with an empty or `null` body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ClientResult<Option<T>> {
        self.execute(PendingCall {
            method: Method::GET,
            path: path.to_string(),
            query: query
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
            body: None,
        })
        .await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> ClientResult<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|err| ClientError::ProtocolDecode(format!("unserializable request: {err}")))?;
        self.execute(PendingCall {
            method: Method::POST,
            path: path.to_string(),
            query: Vec::new(),
            body: Some(body),
        })
        .await
    }

    async fn execute<T: DeserializeOwned>(&self, call: PendingCall) -> ClientResult<Option<T>> {
        let access = self.read_slot(TokenSlot::Access).await?;
        let response = self.send(&call, access.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return decode_response(&call, response).await;
        }

        info!(path = %call.path, "gateway: unauthorized; refreshing credential");
        let fresh = self.refresh_access_token().await?;
        let response = self.send(&call, Some(&fresh)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %call.path, "gateway: still unauthorized after refresh");
            return Err(ClientError::Unauthorized);
        }
        decode_response(&call, response).await
    }

    /// Exchanges the stored refresh credential for a new access credential and
    /// stores it. Any failure clears every credential slot.
    pub async fn refresh_access_token(&self) -> ClientResult<String> {
        match self.try_refresh().await {
            Ok(token) => {
                self.credentials
                    .set(TokenSlot::Access, &token)
                    .await
                    .map_err(ClientError::Storage)?;
                info!("gateway: access credential refreshed");
                Ok(token)
            }
            Err(reason) => {
                warn!(reason = %reason, "gateway: credential refresh failed; clearing session");
                self.credentials.clear().await.map_err(ClientError::Storage)?;
                Err(ClientError::AuthExpired)
            }
        }
    }

    async fn try_refresh(&self) -> Result<String, String> {
        let refresh_token = self
            .read_slot(TokenSlot::Refresh)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| "no refresh credential stored".to_string())?;

        let response = self
            .http
            .post(self.url_for(&self.refresh_path))
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(|err| format!("refresh request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("refresh rejected with {}", response.status()));
        }
        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|err| format!("refresh response unreadable: {err}"))?;
        body.token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| "refresh response carried no token".to_string())
    }

    async fn send(&self, call: &PendingCall, access: Option<&str>) -> ClientResult<Response> {
        let mut request: RequestBuilder = self
            .http
            .request(call.method.clone(), self.url_for(&call.path));
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }
        if let Some(access) = access {
            request = request.bearer_auth(access);
        }

        debug!(method = %call.method, path = %call.path, "gateway: request");
        request.send().await.map_err(|err| {
            warn!(method = %call.method, path = %call.path, error = %err, "gateway: no response");
            ClientError::Connectivity(err.to_string())
        })
    }

    async fn read_slot(&self, slot: TokenSlot) -> ClientResult<Option<String>> {
        let value = self
            .credentials
            .get(slot)
            .await
            .map_err(ClientError::Storage)?;
        Ok(value.filter(|value| !value.is_empty()))
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

async fn decode_response<T: DeserializeOwned>(
    call: &PendingCall,
    response: Response,
) -> ClientResult<Option<T>> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ClientError::Connectivity(err.to_string()))?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(&bytes)
            .ok()
            .and_then(|body| body.text().map(str::to_string))
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        warn!(path = %call.path, status = status.as_u16(), message = %message, "gateway: request rejected");
        return Err(ClientError::ServerRejected {
            status: status.as_u16(),
            message,
        });
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|err| ClientError::ProtocolDecode(format!("{} response: {err}", call.path)))?;
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|err| ClientError::ProtocolDecode(format!("{} response: {err}", call.path)))
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
