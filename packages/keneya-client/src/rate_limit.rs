//! Client-side throttle on OTP send requests.
//!
//! Escalating cooldowns per phone number, persisted so a restart does not
//! reset the counter. This is a UX throttle against accidental SMS storms;
//! the server enforces the real abuse limits.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ApiError, Result};
use crate::storage::{keys, CredentialStore};

/// Attempts allowed before any cooldown applies.
const FREE_ATTEMPTS: u32 = 3;

/// Cooldown per attempt past the free budget: 1 min, 5 min, 15 min,
/// then 30 min for every further attempt.
const COOLDOWNS_SECS: [i64; 4] = [60, 300, 900, 1800];

/// Attempts older than this are forgotten.
const RESET_WINDOW_SECS: i64 = 3600;

/// Per-phone OTP issuance bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub attempt_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

/// Canonical form of a phone number, used as the rate-limit key and sent
/// to the API. Check and record must agree on this or the limiter is a
/// no-op.
pub fn normalize_phone(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    match stripped.strip_prefix("00") {
        Some(rest) => format!("+{}", rest),
        None => stripped,
    }
}

/// Seconds the caller still has to wait, or `None` if a request is
/// allowed now.
fn retry_after(record: Option<&RateLimitRecord>, now: DateTime<Utc>) -> Option<u64> {
    let record = record?;
    if record.attempt_count < FREE_ATTEMPTS {
        return None;
    }

    let step = (record.attempt_count - FREE_ATTEMPTS) as usize;
    let cooldown = COOLDOWNS_SECS[step.min(COOLDOWNS_SECS.len() - 1)];
    let elapsed = now.signed_duration_since(record.last_attempt_at).num_seconds();

    if elapsed < cooldown {
        Some((cooldown - elapsed) as u64)
    } else {
        None
    }
}

/// Fold one more attempt into the record. Attempts beyond the reset
/// window start a fresh count.
fn bump(record: Option<RateLimitRecord>, now: DateTime<Utc>) -> RateLimitRecord {
    let attempt_count = match record {
        Some(ref r)
            if now.signed_duration_since(r.last_attempt_at)
                <= Duration::seconds(RESET_WINDOW_SECS) =>
        {
            r.attempt_count + 1
        }
        _ => 1,
    };

    RateLimitRecord {
        attempt_count,
        last_attempt_at: now,
    }
}

/// Store-backed OTP rate limiter. Purely local; never touches the
/// network.
pub struct OtpRateLimiter {
    store: Arc<dyn CredentialStore>,
}

impl OtpRateLimiter {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Fail with [`ApiError::RateLimited`] if `phone` must wait before
    /// requesting another OTP.
    pub async fn check(&self, phone: &str) -> Result<()> {
        let record = self.load(phone).await?;
        match retry_after(record.as_ref(), Utc::now()) {
            Some(secs) => Err(ApiError::RateLimited { retry_after: secs }),
            None => Ok(()),
        }
    }

    /// Count one accepted OTP send against `phone`.
    pub async fn record_attempt(&self, phone: &str) -> Result<()> {
        let record = bump(self.load(phone).await?, Utc::now());
        let raw = serde_json::to_string(&record)
            .map_err(|e| ApiError::Storage(e.to_string()))?;
        self.store.set(&self.key(phone), &raw).await
    }

    fn key(&self, phone: &str) -> String {
        format!("{}{}", keys::OTP_ATTEMPTS_PREFIX, normalize_phone(phone))
    }

    async fn load(&self, phone: &str) -> Result<Option<RateLimitRecord>> {
        let Some(raw) = self.store.get(&self.key(phone)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A corrupt record must not lock the user out forever.
                warn!(error = %e, "Discarding unreadable rate-limit record");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn record(attempt_count: u32, seconds_ago: i64) -> RateLimitRecord {
        RateLimitRecord {
            attempt_count,
            last_attempt_at: Utc::now() - Duration::seconds(seconds_ago),
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+223 79 00 00 00"), "+22379000000");
        assert_eq!(normalize_phone("00223-79-13-14-16"), "+22379131416");
        assert_eq!(normalize_phone("(223) 79.00.00.00"), "22379000000");
        assert_eq!(normalize_phone("+22379000000"), "+22379000000");
    }

    #[test]
    fn test_missing_record_is_allowed() {
        assert_eq!(retry_after(None, Utc::now()), None);
    }

    #[test]
    fn test_free_attempts() {
        let now = Utc::now();
        for count in 0..FREE_ATTEMPTS {
            assert_eq!(retry_after(Some(&record(count, 0)), now), None);
        }
    }

    #[test]
    fn test_fourth_attempt_waits_a_minute() {
        let now = Utc::now();
        let wait = retry_after(Some(&record(3, 5)), now).unwrap();
        assert!(wait > 0 && wait <= 60, "wait was {}", wait);
    }

    #[test]
    fn test_cooldown_escalates() {
        let now = Utc::now();
        let fourth = retry_after(Some(&record(3, 0)), now).unwrap();
        let fifth = retry_after(Some(&record(4, 0)), now).unwrap();
        let sixth = retry_after(Some(&record(5, 0)), now).unwrap();
        assert_eq!(fourth, 60);
        assert_eq!(fifth, 300);
        assert_eq!(sixth, 900);

        // Past the end of the table the cooldown stays at 30 minutes.
        let tenth = retry_after(Some(&record(9, 0)), now).unwrap();
        assert_eq!(tenth, 1800);
    }

    #[test]
    fn test_cooldown_expiry_allows_again() {
        let now = Utc::now();
        assert_eq!(retry_after(Some(&record(3, 61)), now), None);
    }

    #[test]
    fn test_bump_increments_within_window() {
        let now = Utc::now();
        let bumped = bump(Some(record(2, 30)), now);
        assert_eq!(bumped.attempt_count, 3);
        assert_eq!(bumped.last_attempt_at, now);
    }

    #[test]
    fn test_bump_resets_after_window() {
        let now = Utc::now();
        let bumped = bump(Some(record(7, 2 * 3600)), now);
        assert_eq!(bumped.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_limiter_denies_after_three_rapid_attempts() {
        let store = Arc::new(MemoryStore::new());
        let limiter = OtpRateLimiter::new(store);

        for _ in 0..3 {
            limiter.check("+22379000000").await.unwrap();
            limiter.record_attempt("+22379000000").await.unwrap();
        }

        let denied = limiter.check("+22379000000").await;
        match denied {
            Err(ApiError::RateLimited { retry_after }) => {
                assert!(retry_after > 0 && retry_after <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        // A differently formatted spelling of the same number is still
        // rate limited.
        assert!(limiter.check("00223 79 00 00 00").await.is_err());

        // Another number is unaffected.
        limiter.check("+22376111111").await.unwrap();
    }

    #[tokio::test]
    async fn test_limiter_record_survives_new_instance() {
        let store = Arc::new(MemoryStore::new());
        {
            let limiter = OtpRateLimiter::new(store.clone());
            for _ in 0..3 {
                limiter.record_attempt("+22379000000").await.unwrap();
            }
        }

        let limiter = OtpRateLimiter::new(store);
        assert!(limiter.check("+22379000000").await.is_err());
    }

    #[tokio::test]
    async fn test_stale_record_resets_to_first_attempt() {
        let store = Arc::new(MemoryStore::new());
        let limiter = OtpRateLimiter::new(store.clone());

        // Five attempts, all more than an hour ago.
        let stale = record(5, 2 * 3600);
        store
            .set(
                &limiter.key("+22379000000"),
                &serde_json::to_string(&stale).unwrap(),
            )
            .await
            .unwrap();

        limiter.check("+22379000000").await.unwrap();
        limiter.record_attempt("+22379000000").await.unwrap();

        let raw = store
            .get(&limiter.key("+22379000000"))
            .await
            .unwrap()
            .unwrap();
        let fresh: RateLimitRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(fresh.attempt_count, 1);
    }
}
