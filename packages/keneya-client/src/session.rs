//! Token lifecycle: the session owned by one logged-in patient.
//!
//! The manager is the only writer of session state. Refresh is
//! single-flight: the first caller to observe a stale token performs the
//! network refresh while every concurrent caller parks on the gate and
//! adopts the same outcome, so a burst of 401s costs exactly one refresh
//! request.

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{ApiError, Result};
use crate::storage::{keys, CredentialStore};
use crate::token;
use crate::types::{ApiResponse, Patient, RefreshRequest, TokenPair};

/// Authenticated state for one patient.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub patient_id: String,
    /// Last-known profile, for rendering without a round trip.
    pub patient: Option<Patient>,
}

pub(crate) struct SessionManager {
    http: Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    state: RwLock<Option<Session>>,
    refresh_gate: Mutex<()>,
}

impl SessionManager {
    /// Rebuild the session from the credential store. Tokens that no
    /// longer decode are discarded rather than propagated, so one bad
    /// write cannot brick startup.
    pub(crate) async fn load(
        http: Client,
        base_url: String,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let access = store.get(keys::ACCESS_TOKEN).await?;
        let refresh = store.get(keys::REFRESH_TOKEN).await?;
        let cached = store.get(keys::CURRENT_PATIENT).await?;

        let state = match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => {
                match token::patient_id(&access_token) {
                    Ok(patient_id) => {
                        let patient =
                            cached.and_then(|raw| serde_json::from_str(&raw).ok());
                        debug!(%patient_id, "Restored session from store");
                        Some(Session {
                            access_token,
                            refresh_token,
                            patient_id,
                            patient,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Discarding stored session with undecodable token");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(Self {
            http,
            base_url,
            store,
            state: RwLock::new(state),
            refresh_gate: Mutex::new(()),
        })
    }

    pub(crate) async fn session(&self) -> Option<Session> {
        self.state.read().await.clone()
    }

    pub(crate) async fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub(crate) async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_some()
    }

    pub(crate) async fn current_patient(&self) -> Option<Patient> {
        self.state.read().await.as_ref().and_then(|s| s.patient.clone())
    }

    /// Install the token pair from a successful OTP verification.
    pub(crate) async fn install(&self, pair: TokenPair) -> Result<Session> {
        let refresh_token = pair.refresh_token.ok_or_else(|| {
            ApiError::Parse("verify response missing refresh token".to_string())
        })?;
        let patient_id = token::patient_id(&pair.access_token)?;

        self.store
            .set(keys::ACCESS_TOKEN, &pair.access_token)
            .await?;
        self.store.set(keys::REFRESH_TOKEN, &refresh_token).await?;

        let session = Session {
            access_token: pair.access_token,
            refresh_token,
            patient_id,
            patient: None,
        };
        *self.state.write().await = Some(session.clone());
        Ok(session)
    }

    /// Cache the fetched profile in memory and on disk.
    pub(crate) async fn cache_patient(&self, patient: &Patient) -> Result<()> {
        let raw = serde_json::to_string(patient)
            .map_err(|e| ApiError::Storage(e.to_string()))?;
        self.store.set(keys::CURRENT_PATIENT, &raw).await?;

        if let Some(session) = self.state.write().await.as_mut() {
            session.patient = Some(patient.clone());
        }
        Ok(())
    }

    /// Clear the session and its persisted backing. Idempotent, and never
    /// fails: a storage error is logged and swallowed so logout cannot
    /// strand the UI.
    pub(crate) async fn logout(&self) {
        *self.state.write().await = None;

        for key in [keys::ACCESS_TOKEN, keys::REFRESH_TOKEN, keys::CURRENT_PATIENT] {
            if let Err(e) = self.store.remove(key).await {
                warn!(key, error = %e, "Failed to clear stored credential");
            }
        }
    }

    /// Mint a new access token. Called by the gateway on 401.
    ///
    /// `observed` is the access token the failing request was sent with
    /// (None for an unauthenticated send). Exactly one network refresh
    /// happens per burst of concurrent callers: late arrivals find the
    /// token already changed (or the session gone) and return without
    /// touching the network.
    pub(crate) async fn refresh(&self, observed: Option<&str>) -> Result<Session> {
        let _gate = self.refresh_gate.lock().await;

        let current = self.state.read().await.clone();
        let session = match (current, observed) {
            // A refresh completed while we were waiting for the gate.
            (Some(cur), Some(seen)) if cur.access_token != seen => {
                return Ok(cur);
            }
            // Caller had no token, but a session exists now.
            (Some(cur), None) => return Ok(cur),
            // The refresh ahead of us failed and tore the session down,
            // or there never was a session to refresh.
            (None, _) => return Err(ApiError::SessionExpired),
            // Still holding the token that just 401'd: refresh for real.
            (Some(cur), Some(_)) => cur,
        };

        debug!("Refreshing access token");
        match self.request_refresh(&session.refresh_token).await {
            Ok(pair) => {
                // Install and persist under the same write lock so a
                // concurrent logout can never be overwritten.
                let mut state = self.state.write().await;
                let Some(live) = state.as_mut() else {
                    // Logged out while the refresh was in flight; do
                    // not resurrect the session.
                    return Err(ApiError::SessionExpired);
                };
                live.access_token = pair.access_token;
                if let Some(rotated) = pair.refresh_token {
                    live.refresh_token = rotated;
                }
                let snapshot = live.clone();

                // The refreshed session is valid even if persisting it
                // fails; the next launch just re-authenticates.
                if let Err(e) = self.persist_tokens(&snapshot).await {
                    warn!(error = %e, "Failed to persist refreshed tokens");
                }
                debug!("Access token refreshed");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, clearing session");
                self.logout().await;
                Err(ApiError::SessionExpired)
            }
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let response = self
            .http
            .post(format!("{}/authentication/refresh-token", self.base_url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse<TokenPair> = response.json().await?;
        Ok(body.data)
    }

    async fn persist_tokens(&self, session: &Session) -> Result<()> {
        self.store
            .set(keys::ACCESS_TOKEN, &session.access_token)
            .await?;
        self.store
            .set(keys::REFRESH_TOKEN, &session.refresh_token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::User;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn access_token_for(patient_id: &str) -> String {
        encode(
            &Header::default(),
            &serde_json::json!({
                "sub": "user-1",
                "infos": {"patient": {"id": patient_id}},
            }),
            &EncodingKey::from_secret(b"test_secret"),
        )
        .unwrap()
    }

    fn patient(id: &str) -> Patient {
        Patient {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            birth_date: None,
            user: User {
                id: "user-1".to_string(),
                email: Some("awa@example.org".to_string()),
                first_name: "Awa".to_string(),
                last_name: "Traoré".to_string(),
                phone: "+22379000000".to_string(),
                created_at: None,
                updated_at: None,
            },
            created_at: None,
            updated_at: None,
        }
    }

    async fn manager(store: Arc<dyn CredentialStore>) -> SessionManager {
        SessionManager::load(Client::new(), "http://127.0.0.1:9".to_string(), store)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_install_then_reload_reconstructs_session() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        let access = access_token_for("patient-7");

        let mgr = manager(store.clone()).await;
        mgr.install(TokenPair {
            access_token: access.clone(),
            refresh_token: Some("r1".to_string()),
        })
        .await
        .unwrap();
        mgr.cache_patient(&patient("patient-7")).await.unwrap();

        // Simulated restart: a fresh manager over the same store.
        let reloaded = manager(store).await;
        let session = reloaded.session().await.unwrap();
        assert_eq!(session.access_token, access);
        assert_eq!(session.refresh_token, "r1");
        assert_eq!(session.patient_id, "patient-7");
        assert_eq!(session.patient.unwrap().user.first_name, "Awa");
    }

    #[tokio::test]
    async fn test_install_requires_refresh_token() {
        let mgr = manager(Arc::new(MemoryStore::new())).await;
        let result = mgr
            .install(TokenPair {
                access_token: access_token_for("p1"),
                refresh_token: None,
            })
            .await;
        assert!(matches!(result, Err(ApiError::Parse(_))));
        assert!(!mgr.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_undecodable_stored_token_is_discarded() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        store.set(keys::ACCESS_TOKEN, "garbage").await.unwrap();
        store.set(keys::REFRESH_TOKEN, "r1").await.unwrap();

        let mgr = manager(store).await;
        assert!(!mgr.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone()).await;
        mgr.install(TokenPair {
            access_token: access_token_for("p1"),
            refresh_token: Some("r1".to_string()),
        })
        .await
        .unwrap();

        mgr.logout().await;
        mgr.logout().await;

        assert!(!mgr.is_authenticated().await);
        assert_eq!(store.get(keys::ACCESS_TOKEN).await.unwrap(), None);
        assert_eq!(store.get(keys::REFRESH_TOKEN).await.unwrap(), None);
        assert_eq!(store.get(keys::CURRENT_PATIENT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_without_session_fails_fast() {
        let mgr = manager(Arc::new(MemoryStore::new())).await;
        assert!(matches!(
            mgr.refresh(None).await,
            Err(ApiError::SessionExpired)
        ));
        assert!(matches!(
            mgr.refresh(Some("stale")).await,
            Err(ApiError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_refresh_skips_network_when_token_already_rotated() {
        // The manager points at an unroutable address, so any attempt to
        // actually call the refresh endpoint fails loudly.
        let mgr = manager(Arc::new(MemoryStore::new())).await;
        mgr.install(TokenPair {
            access_token: access_token_for("p1"),
            refresh_token: Some("r1".to_string()),
        })
        .await
        .unwrap();

        // A caller whose request went out with an older token adopts the
        // current session without refreshing.
        let session = mgr.refresh(Some("some-older-token")).await.unwrap();
        assert_eq!(session.refresh_token, "r1");
    }
}
