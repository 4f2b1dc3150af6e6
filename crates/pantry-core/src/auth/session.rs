use std::fmt;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Access-token lifetime assumed when the backend does not send one.
/// The backend issues 15 minute access tokens; one minute is held back as buffer.
pub const DEFAULT_TOKEN_WINDOW_SECS: i64 = 14 * 60;

/// Renew this long before the access token expires.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Expiry instants are kept at the precision of their persisted form.
pub fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(3)
}

/// The authenticated identity.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expiry: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        email: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            email: email.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_token_expiry: Some(truncate_to_millis(expiry)),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// True once `now` has reached the access-token expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.access_token_expiry
            .map(|expiry| expiry <= now)
            .unwrap_or(true)
    }

    /// How long to wait before renewing: `max(0, expiry - now - margin)`.
    /// `None` when there is no expiry to schedule against.
    pub fn refresh_delay(&self, now: DateTime<Utc>, margin: Duration) -> Option<std::time::Duration> {
        let expiry = self.access_token_expiry?;
        let wait = expiry - now - margin;
        Some(wait.to_std().unwrap_or(std::time::Duration::ZERO))
    }

    /// Delay before renewing a token that was just issued: as `refresh_delay`,
    /// but never less than half of its remaining lifetime, so a lifetime
    /// shorter than `margin` does not renew back to back.
    pub fn renewal_delay(&self, now: DateTime<Utc>, margin: Duration) -> Option<std::time::Duration> {
        let delay = self.refresh_delay(now, margin)?;
        let expiry = self.access_token_expiry?;
        let half_life = ((expiry - now) / 2)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        Some(delay.max(half_life))
    }

    /// Persisted form; `None` for a session without an expiry.
    pub fn to_record(&self) -> Option<SessionRecord> {
        Some(SessionRecord {
            user_email: self.email.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expiration: self.access_token_expiry?,
        })
    }
}

// Tokens never show up in logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("email", &self.email)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("access_token_expiry", &self.access_token_expiry)
            .finish()
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// The session as stored under `"<app>-userData"`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionRecord {
    pub user_email: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "iso_millis")]
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub expiration: DateTime<Utc>,
}

impl SessionRecord {
    pub fn into_session(self) -> Session {
        Session::new(
            self.user_email,
            self.access_token,
            self.refresh_token,
            self.expiration,
        )
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("user_email", &self.user_email)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2025-03-01T12:00:00.000Z`.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(instant: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&instant.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Where the session manager currently stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticated(Session),
    /// Renewal in progress; the old access token is still held.
    Refreshing(Session),
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Anonymous => None,
            SessionState::Authenticated(session) | SessionState::Refreshing(session) => {
                Some(session)
            }
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.session().map(Session::is_logged_in).unwrap_or(false)
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self, SessionState::Refreshing(_))
    }

    pub fn access_token(&self) -> Option<&str> {
        self.session().map(|s| s.access_token.as_str())
    }

    pub fn email(&self) -> Option<&str> {
        self.session().map(|s| s.email.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    User,
    RefreshFailed,
}

/// Identity changes broadcast to dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { email: String },
    Refreshed,
    LoggedOut { reason: LogoutReason },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_expiry() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::milliseconds(250)
    }

    #[test]
    fn test_record_uses_storage_field_names() {
        let session = Session::new("cook@example.com", "access", "refresh", sample_expiry());
        let record = session.to_record().expect("session has expiry");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "userEmail": "cook@example.com",
                "accessToken": "access",
                "refreshToken": "refresh",
                "expiration": "2025-03-01T12:00:00.250Z",
            })
        );
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let session = Session::new(
            "cook@example.com",
            "access",
            "refresh",
            Utc::now() + Duration::minutes(5),
        );
        let record = session.to_record().unwrap();

        let stored = serde_json::to_string(&record).unwrap();
        let restored: SessionRecord = serde_json::from_str(&stored).unwrap();

        assert_eq!(restored, record);
        assert_eq!(restored.into_session(), session);
    }

    #[test]
    fn test_record_accepts_offset_timestamps() {
        let json = r#"{"userEmail":"a@b.c","accessToken":"x","refreshToken":"y","expiration":"2025-03-01T20:00:00.000+08:00"}"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.expiration, Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_new_truncates_expiry_to_millis() {
        let precise = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
            + Duration::nanoseconds(123_456_789);
        let session = Session::new("a", "b", "c", precise);
        assert_eq!(
            session.access_token_expiry,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + Duration::milliseconds(123))
        );
    }

    #[test]
    fn test_refresh_delay_subtracts_margin_and_clamps() {
        let now = Utc::now();
        let session = Session::new("a", "b", "c", now + Duration::minutes(10));

        let delay = session
            .refresh_delay(now, Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS))
            .unwrap();
        assert!(delay <= std::time::Duration::from_secs(9 * 60));
        assert!(delay >= std::time::Duration::from_secs(9 * 60 - 1));

        let expired = Session::new("a", "b", "c", now - Duration::minutes(1));
        assert_eq!(
            expired.refresh_delay(now, Duration::seconds(60)),
            Some(std::time::Duration::ZERO)
        );

        assert_eq!(Session::default().refresh_delay(now, Duration::zero()), None);
    }

    #[test]
    fn test_renewal_delay_waits_half_of_a_short_lifetime() {
        let now = truncate_to_millis(Utc::now());
        let margin = Duration::seconds(60);

        // Lifetime inside the margin: half of it, not zero
        let short = Session::new("a", "b", "c", now + Duration::seconds(30));
        assert_eq!(short.refresh_delay(now, margin), Some(std::time::Duration::ZERO));
        assert_eq!(
            short.renewal_delay(now, margin),
            Some(std::time::Duration::from_secs(15))
        );

        // Ordinary lifetime: the margin rule wins
        let normal = Session::new("a", "b", "c", now + Duration::minutes(14));
        assert_eq!(
            normal.renewal_delay(now, margin),
            normal.refresh_delay(now, margin)
        );

        assert_eq!(Session::default().renewal_delay(now, margin), None);
    }

    #[test]
    fn test_state_accessors() {
        let session = Session::new("a@b.c", "token", "refresh", Utc::now() + Duration::minutes(1));

        assert!(!SessionState::Anonymous.is_logged_in());
        assert_eq!(SessionState::Anonymous.access_token(), None);

        let authenticated = SessionState::Authenticated(session.clone());
        assert!(authenticated.is_logged_in());
        assert_eq!(authenticated.email(), Some("a@b.c"));

        let refreshing = SessionState::Refreshing(session);
        assert!(refreshing.is_logged_in());
        assert!(refreshing.is_refreshing());
        assert_eq!(refreshing.access_token(), Some("token"));
    }

    #[test]
    fn test_debug_output_hides_tokens() {
        let session = Session::new("a@b.c", "secret-access", "secret-refresh", Utc::now());
        let rendered = format!("{:?} {:?}", session, session.to_record().unwrap());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("a@b.c"));
    }
}
