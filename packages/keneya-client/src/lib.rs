//! REST API client for the Keneya appointment booking app.
//!
//! Wraps the Keneya backend behind an authenticated request gateway:
//! phone + OTP login, durable token storage, transparent single-flight
//! token refresh on 401, and a client-side throttle on OTP sends.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keneya_client::{ApiClient, FileStore};
//!
//! let store = Arc::new(FileStore::open("keneya.json").await?);
//! let client = ApiClient::new("https://api.keneya.example", store).await?;
//!
//! if !client.is_authenticated().await {
//!     client.request_otp("+223 79 00 00 00").await?;
//!     // code arrives by SMS
//!     let patient = client.verify_otp("+223 79 00 00 00", "123456").await?;
//!     println!("Bonjour {}", patient.user.first_name);
//! }
//!
//! // Authenticated calls refresh expired tokens on their own.
//! let appointments = client
//!     .get_patient_appointments(&client.current_patient().await.unwrap().id)
//!     .await?;
//! ```

pub mod error;
pub mod rate_limit;
pub mod session;
pub mod storage;
pub mod token;
pub mod types;

pub use error::{ApiError, Result};
pub use session::Session;
pub use storage::{CredentialStore, FileStore, MemoryStore};
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use rate_limit::{normalize_phone, OtpRateLimiter};
use session::SessionManager;

/// Every call to the backend carries this timeout; a timed-out call is a
/// network failure, never an auth failure.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// This client only ever authenticates patients.
const CLIENT_TYPE: &str = "patient";

/// Keneya API client.
///
/// Cheap to clone; clones share the session, the HTTP connection pool and
/// the credential store.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    auth: Arc<SessionManager>,
    limiter: Arc<OtpRateLimiter>,
}

impl ApiClient {
    /// Create a client against `base_url`, restoring any persisted
    /// session from `store`.
    pub async fn new(
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        let auth = Arc::new(
            SessionManager::load(http.clone(), base_url.clone(), store.clone()).await?,
        );

        Ok(Self {
            http,
            base_url,
            auth,
            limiter: Arc::new(OtpRateLimiter::new(store)),
        })
    }

    /// Create from the `KENEYA_API_URL` environment variable.
    pub async fn from_env(store: Arc<dyn CredentialStore>) -> Result<Self> {
        let base_url = std::env::var("KENEYA_API_URL")
            .map_err(|_| ApiError::Config("KENEYA_API_URL not set".to_string()))?;
        Self::new(base_url, store).await
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // Authentication

    /// Ask the backend to text an OTP to `phone`.
    ///
    /// The local throttle runs first; a denied request fails with
    /// [`ApiError::RateLimited`] without touching the network. An attempt
    /// only counts against the budget once the server accepts the send,
    /// so outages do not burn the budget.
    pub async fn request_otp(&self, phone: &str) -> Result<()> {
        let phone = normalize_phone(phone);
        self.limiter.check(&phone).await?;

        let response = self
            .http
            .post(format!("{}/authentication/login", self.base_url))
            .json(&LoginRequest {
                phone: &phone,
                client_type: CLIENT_TYPE,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = %status, "OTP send rejected");
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        self.limiter.record_attempt(&phone).await?;
        debug!(%phone, "OTP send accepted");
        Ok(())
    }

    /// Exchange an OTP for a session, then fetch and cache the profile.
    ///
    /// A rejected code fails with [`ApiError::InvalidCode`] and leaves
    /// any existing session untouched.
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<Patient> {
        let phone = normalize_phone(phone);
        let response = self
            .http
            .post(format!("{}/authentication/verify-otp", self.base_url))
            .json(&VerifyOtpRequest {
                phone: &phone,
                otp: code,
                client_type: CLIENT_TYPE,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            debug!(status = %status, "OTP verification rejected");
            return Err(ApiError::InvalidCode);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse<TokenPair> = response.json().await?;
        let session = self.auth.install(body.data).await?;

        let patient = self.get_patient(&session.patient_id).await?;
        self.auth.cache_patient(&patient).await?;
        debug!(patient_id = %patient.id, "Patient logged in");
        Ok(patient)
    }

    /// Drop the session and wipe stored credentials. Never fails,
    /// including when called twice or during an in-flight refresh.
    pub async fn logout(&self) {
        self.auth.logout().await;
        debug!("Logged out");
    }

    pub async fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated().await
    }

    pub async fn session(&self) -> Option<Session> {
        self.auth.session().await
    }

    /// Last-known profile without a network round trip.
    pub async fn current_patient(&self) -> Option<Patient> {
        self.auth.current_patient().await
    }

    // Patients

    pub async fn get_patient(&self, patient_id: &str) -> Result<Patient> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/patients/{}", self.base_url, patient_id)),
            )
            .await?;
        let body: ApiResponse<Patient> = response.json().await?;
        Ok(body.data)
    }

    /// Update the profile and refresh the local cache with the result.
    pub async fn update_patient(
        &self,
        patient_id: &str,
        update: &UpdatePatientRequest,
    ) -> Result<Patient> {
        let response = self
            .send(
                self.http
                    .put(format!("{}/patients/{}", self.base_url, patient_id))
                    .json(update),
            )
            .await?;
        let body: ApiResponse<Patient> = response.json().await?;
        self.auth.cache_patient(&body.data).await?;
        Ok(body.data)
    }

    // Specialties

    pub async fn get_specialties(&self) -> Result<Vec<Specialty>> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/specialties", self.base_url))
                    .query(&[("page", "1"), ("limit", "100"), ("sort", "name:ASC")]),
            )
            .await?;
        let body: ApiResponse<Vec<Specialty>> = response.json().await?;
        Ok(body.data)
    }

    // Practicians

    pub async fn search_practicians(
        &self,
        filters: &SearchFilters,
    ) -> Result<Vec<Practician>> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/practicians", self.base_url))
                    .query(filters),
            )
            .await?;
        let body: ApiResponse<Vec<Practician>> = response.json().await?;
        Ok(body.data)
    }

    pub async fn get_practician(&self, practician_id: &str) -> Result<Practician> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/practicians/{}", self.base_url, practician_id)),
            )
            .await?;
        let body: ApiResponse<Practician> = response.json().await?;
        Ok(body.data)
    }

    /// Available slots for one practician on one day.
    pub async fn get_practician_time_slots(
        &self,
        practician_id: &str,
        date: &str,
    ) -> Result<Vec<TimeSlot>> {
        let response = self
            .send(
                self.http
                    .get(format!(
                        "{}/practicians/{}/time-slots",
                        self.base_url, practician_id
                    ))
                    .query(&[
                        ("startDate", date),
                        ("endDate", date),
                        ("sort", "startTime:ASC"),
                    ]),
            )
            .await?;
        let body: ApiResponse<Option<Vec<TimeSlot>>> = response.json().await?;
        Ok(body.data.unwrap_or_default())
    }

    // Establishments

    pub async fn search_establishments(
        &self,
        filters: &SearchFilters,
    ) -> Result<Vec<Establishment>> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/establishments", self.base_url))
                    .query(filters),
            )
            .await?;
        let body: ApiResponse<Vec<Establishment>> = response.json().await?;
        Ok(body.data)
    }

    pub async fn get_establishment(&self, establishment_id: &str) -> Result<Establishment> {
        let response = self
            .send(self.http.get(format!(
                "{}/establishments/{}",
                self.base_url, establishment_id
            )))
            .await?;
        let body: ApiResponse<Establishment> = response.json().await?;
        Ok(body.data)
    }

    pub async fn get_establishment_time_slots(
        &self,
        establishment_id: &str,
        date: &str,
    ) -> Result<Vec<TimeSlot>> {
        let response = self
            .send(
                self.http
                    .get(format!(
                        "{}/establishments/{}/time-slots",
                        self.base_url, establishment_id
                    ))
                    .query(&[
                        ("page", "1"),
                        ("limit", "50"),
                        ("sort", "startTime:ASC"),
                        ("date", date),
                    ]),
            )
            .await?;
        let body: ApiResponse<Option<Vec<TimeSlot>>> = response.json().await?;
        Ok(body.data.unwrap_or_default())
    }

    pub async fn get_establishment_practicians(
        &self,
        establishment_id: &str,
    ) -> Result<Vec<Practician>> {
        let response = self
            .send(
                self.http
                    .get(format!(
                        "{}/establishments/{}/practicians",
                        self.base_url, establishment_id
                    ))
                    .query(&[("page", "1"), ("limit", "50"), ("sort", "firstName:ASC")]),
            )
            .await?;
        let body: ApiResponse<Option<Vec<Practician>>> = response.json().await?;
        Ok(body.data.unwrap_or_default())
    }

    // Appointments

    pub async fn create_appointment(
        &self,
        request: &CreateAppointmentRequest,
    ) -> Result<Appointment> {
        let response = self
            .send(
                self.http
                    .post(format!("{}/appointments", self.base_url))
                    .json(request),
            )
            .await?;
        let body: ApiResponse<Appointment> = response.json().await?;
        Ok(body.data)
    }

    pub async fn get_patient_appointments(
        &self,
        patient_id: &str,
    ) -> Result<Vec<Appointment>> {
        let response = self
            .send(self.http.get(format!(
                "{}/patients/{}/appointments",
                self.base_url, patient_id
            )))
            .await?;
        let body: ApiResponse<Vec<Appointment>> = response.json().await?;
        Ok(body.data)
    }

    pub async fn get_appointment(&self, appointment_id: &str) -> Result<Appointment> {
        let response = self
            .send(self.http.get(format!(
                "{}/appointments/{}",
                self.base_url, appointment_id
            )))
            .await?;
        let body: ApiResponse<Appointment> = response.json().await?;
        Ok(body.data)
    }

    pub async fn cancel_appointment(&self, appointment_id: &str) -> Result<Appointment> {
        let response = self
            .send(self.http.put(format!(
                "{}/appointments/{}/cancel",
                self.base_url, appointment_id
            )))
            .await?;
        let body: ApiResponse<Appointment> = response.json().await?;
        Ok(body.data)
    }

    // Gateway

    /// Dispatch a request with the current bearer token, refreshing and
    /// retrying exactly once on 401.
    ///
    /// The retry replays a clone taken before dispatch, so method, path,
    /// body and headers are bit-identical; only the Authorization header
    /// differs. Non-401 failures pass through untouched and never
    /// trigger a refresh.
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let retry = builder.try_clone();

        let sent_with = self.auth.access_token().await;
        let builder = match &sent_with {
            Some(access_token) => builder.bearer_auth(access_token),
            None => builder,
        };
        let response = builder.send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::into_result(response).await;
        }

        let Some(retry) = retry else {
            // A non-replayable body cannot be retried.
            return Self::into_result(response).await;
        };

        debug!("Request returned 401, refreshing token");
        let session = self.auth.refresh(sent_with.as_deref()).await?;
        let response = retry.bearer_auth(session.access_token).send().await?;
        Self::into_result(response).await
    }

    async fn into_result(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        warn!(status = %status, "Keneya API error");
        Err(ApiError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
