use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wrapper for Keneya API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Account record shared by patients and practicians.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A patient profile. Cached locally after login for offline display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub birth_date: Option<String>,
    pub user: User,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Medical specialty (cardiology, pediatrics, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specialty {
    pub id: String,
    pub name: String,
}

/// A practician and the specialties they cover.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Practician {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub specialties: Vec<Specialty>,
    pub user: User,
}

/// Named reference (establishment affiliation, establishment type).
#[derive(Debug, Clone, Deserialize)]
pub struct NamedRef {
    pub id: String,
    pub name: String,
}

/// A clinic, hospital or health center.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Establishment {
    pub id: String,
    pub name: String,
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub specialties: Vec<Specialty>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub affiliation: Option<NamedRef>,
    #[serde(rename = "type", default)]
    pub establishment_type: Option<NamedRef>,
}

/// A bookable slot in a practician's or establishment's calendar.
///
/// `start_time`/`end_time` are wall-clock strings ("09:30"), `date` is an
/// ISO date ("2026-08-07"); the API never sends timezone-qualified slots.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub id: String,
    pub start_time: String,
    pub end_time: String,
    pub is_available: bool,
    pub date: String,
    #[serde(default)]
    pub practician_id: Option<String>,
    #[serde(default)]
    pub establishment_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

/// A booked appointment, with or against a specific practician.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub patient_id: String,
    #[serde(default)]
    pub practician_id: Option<String>,
    #[serde(default)]
    pub establishment_id: Option<String>,
    pub time_slot_id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub practician: Option<Practician>,
    #[serde(default)]
    pub establishment: Option<Establishment>,
}

/// Token pair returned by verify-otp and refresh-token.
///
/// The refresh endpoint may rotate the refresh token; when it does not,
/// `refresh_token` is absent and the stored one stays valid.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest<'a> {
    pub phone: &'a str,
    pub client_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VerifyOtpRequest<'a> {
    pub phone: &'a str,
    pub otp: &'a str,
    pub client_type: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Query filters for practician and establishment search.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

/// Body for booking an appointment against a time slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppointmentRequest {
    pub patient_id: String,
    pub time_slot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Patient fields that can be edited from the profile screen.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePatientRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appointment_status_wire_format() {
        let status: AppointmentStatus = serde_json::from_str("\"no-show\"").unwrap();
        assert_eq!(status, AppointmentStatus::NoShow);
        assert_eq!(
            serde_json::to_string(&AppointmentStatus::Scheduled).unwrap(),
            "\"scheduled\""
        );
    }

    #[test]
    fn test_token_pair_without_rotation() {
        let pair: TokenPair =
            serde_json::from_str(r#"{"access_token": "a1"}"#).unwrap();
        assert_eq!(pair.access_token, "a1");
        assert!(pair.refresh_token.is_none());
    }

    #[test]
    fn test_search_filters_skip_empty() {
        let filters = SearchFilters {
            city: Some("Bamako".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&filters).unwrap();
        assert_eq!(json, serde_json::json!({"city": "Bamako"}));
    }
}
