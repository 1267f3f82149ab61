use std::sync::Arc;

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use serde::Deserialize;
use shared::domain::{TokenSlot, UserId, UserIdentity};
use storage::CredentialStore;
use tracing::{info, warn};

use crate::error::{ClientError, ClientResult};

const PAD_INDIFFERENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_ANY_PAD: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, PAD_INDIFFERENT);
const STANDARD_ANY_PAD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PAD_INDIFFERENT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Chat,
}

/// Moves the user between the login and chat views.
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: Route);
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: String,
    #[serde(rename = "cognito:username", default)]
    cognito_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Reads the claims segment of a `header.claims.signature` token. The
/// signature is not verified; the gateway does that.
pub fn decode_identity_token(token: &str) -> ClientResult<UserIdentity> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    let [_, claims, _] = segments.as_slice() else {
        return Err(ClientError::ProtocolDecode(format!(
            "identity token has {} segments, expected 3",
            segments.len()
        )));
    };

    let raw = URL_SAFE_ANY_PAD
        .decode(claims)
        .or_else(|_| STANDARD_ANY_PAD.decode(claims))
        .map_err(|err| ClientError::ProtocolDecode(format!("identity claims are not base64: {err}")))?;
    let claims: IdentityClaims = serde_json::from_slice(&raw)
        .map_err(|err| ClientError::ProtocolDecode(format!("identity claims are not json: {err}")))?;

    let username = claims
        .cognito_username
        .clone()
        .or_else(|| claims.email.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    Ok(UserIdentity {
        id: UserId(claims.sub),
        username,
        email: claims.email,
    })
}

/// Derives who is signed in from whatever the credential store currently holds.
#[derive(Clone)]
pub struct SessionResolver {
    store: Arc<dyn CredentialStore>,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Never cached: every call decodes the currently stored identity token.
    pub async fn resolve_current_user(&self) -> Option<UserIdentity> {
        let token = self.read(TokenSlot::Identity).await?;
        match decode_identity_token(&token) {
            Ok(identity) => Some(identity),
            Err(err) => {
                warn!(error = %err, "session: stored identity token is undecodable");
                None
            }
        }
    }

    /// Authenticated means both the access and identity tokens are present.
    pub async fn is_authenticated(&self) -> bool {
        self.read(TokenSlot::Access).await.is_some()
            && self.read(TokenSlot::Identity).await.is_some()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.read(TokenSlot::Access).await
    }

    pub async fn clear(&self) -> ClientResult<()> {
        self.store.clear().await.map_err(ClientError::Storage)
    }

    async fn read(&self, slot: TokenSlot) -> Option<String> {
        match self.store.get(slot).await {
            Ok(value) => value.filter(|value| !value.is_empty()),
            Err(err) => {
                warn!(slot = slot.storage_key(), error = %err, "session: credential read failed");
                None
            }
        }
    }
}

/// Finishes the identity provider redirect: `fragment` is the callback URL or
/// just its `#id_token=..&access_token=..` part.
pub async fn complete_login_handoff(
    fragment: &str,
    store: &dyn CredentialStore,
    navigator: &dyn Navigator,
) -> ClientResult<Route> {
    let fragment = fragment.trim();
    let fragment = fragment
        .split_once('#')
        .map_or(fragment, |(_, fragment)| fragment);

    let mut id_token = None;
    let mut access_token = None;
    let mut refresh_token = None;
    for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "id_token" => id_token = Some(value.into_owned()),
            "access_token" => access_token = Some(value.into_owned()),
            "refresh_token" => refresh_token = Some(value.into_owned()),
            _ => {}
        }
    }

    let (Some(id_token), Some(access_token)) = (id_token, access_token) else {
        warn!("login hand-off is missing id_token or access_token");
        navigator.navigate(Route::Login);
        return Ok(Route::Login);
    };

    let stored = async {
        store.set(TokenSlot::Identity, &id_token).await?;
        store.set(TokenSlot::Access, &access_token).await?;
        if let Some(refresh_token) = &refresh_token {
            store.set(TokenSlot::Refresh, refresh_token).await?;
        }
        anyhow::Ok(())
    }
    .await;
    if let Err(err) = stored {
        navigator.navigate(Route::Login);
        return Err(ClientError::Storage(err));
    }

    info!(refresh = refresh_token.is_some(), "login hand-off stored credentials");
    navigator.navigate(Route::Chat);
    Ok(Route::Chat)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
