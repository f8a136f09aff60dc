//! # Payload Schema Validation
//!
//! Turns a verified raw body into a typed, validated envelope. Decoding and
//! validation are separate steps so the structural payload can be stored on
//! the audit record (and replayed later) even when validation fails.
//!
//! Every rejection names the offending field with a dotted path such as
//! `start.dateTime` or `attendees[2].email`.

use crate::{Timestamp, WebhookSource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Errors
// ============================================================================

/// Field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid field '{field}': {reason}")]
pub struct SchemaError {
    pub field: String,
    pub reason: String,
}

impl SchemaError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "is required")
    }
}

// ============================================================================
// Telephony
// ============================================================================

/// Call progress reported by the voice provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Initiated,
    Answered,
    Completed,
    Busy,
    Failed,
    NoAnswer,
}

impl CallStatus {
    const ALLOWED: &'static str = "ringing, initiated, answered, completed, busy, failed, no-answer";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Initiated => "initiated",
            Self::Answered => "answered",
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::NoAnswer => "no-answer",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "ringing" => Some(Self::Ringing),
            "initiated" => Some(Self::Initiated),
            "answered" => Some(Self::Answered),
            "completed" => Some(Self::Completed),
            "busy" => Some(Self::Busy),
            "failed" => Some(Self::Failed),
            "no-answer" => Some(Self::NoAnswer),
            _ => None,
        }
    }
}

/// Call status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelephonyEvent {
    pub call_sid: String,
    pub call_status: CallStatus,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Seconds
    pub call_duration: Option<u32>,
    pub recording_url: Option<String>,
    pub transcription_text: Option<String>,
    pub direction: Option<String>,
}

// ============================================================================
// Calendar
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarEventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl CalendarEventStatus {
    const ALLOWED: &'static str = "confirmed, tentative, cancelled";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Tentative => "tentative",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "confirmed" => Some(Self::Confirmed),
            "tentative" => Some(Self::Tentative),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attendee {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub organizer: bool,
    pub response_status: Option<String>,
}

/// Synced calendar event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub status: CalendarEventStatus,
    pub attendees: Vec<Attendee>,
    pub organizer_email: Option<String>,
    pub calendar_id: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
}

// ============================================================================
// SMS delivery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsDeliveryStatus {
    Sent,
    Delivered,
    Failed,
    Rejected,
    Expired,
    Unknown,
}

impl SmsDeliveryStatus {
    const ALLOWED: &'static str = "sent, delivered, failed, rejected, expired, unknown";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Delivery receipt for an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsDeliveryEvent {
    pub message_id: String,
    pub status: SmsDeliveryStatus,
    pub timestamp: Timestamp,
    pub from: Option<String>,
    pub to: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

// ============================================================================
// Review platform
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPlatform {
    Google,
    Yelp,
    Facebook,
    Tripadvisor,
    Other,
}

impl ReviewPlatform {
    const ALLOWED: &'static str = "google, yelp, facebook, tripadvisor, other";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Yelp => "yelp",
            Self::Facebook => "facebook",
            Self::Tripadvisor => "tripadvisor",
            Self::Other => "other",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "google" => Some(Self::Google),
            "yelp" => Some(Self::Yelp),
            "facebook" => Some(Self::Facebook),
            "tripadvisor" => Some(Self::Tripadvisor),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// New review left on a public platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewEvent {
    pub review_id: String,
    pub business_id: String,
    /// 1 to 5 inclusive
    pub rating: u8,
    pub platform: ReviewPlatform,
    pub reviewer_name: Option<String>,
    pub review_text: Option<String>,
    pub review_url: Option<String>,
    pub review_date: Option<Timestamp>,
}

// ============================================================================
// Envelope
// ============================================================================

/// Validated webhook payload, one variant per provider family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEnvelope {
    Telephony(TelephonyEvent),
    Calendar(CalendarEvent),
    SmsDelivery(SmsDeliveryEvent),
    Review(ReviewEvent),
}

impl TypedEnvelope {
    pub fn source(&self) -> WebhookSource {
        match self {
            Self::Telephony(_) => WebhookSource::Telephony,
            Self::Calendar(_) => WebhookSource::Calendar,
            Self::SmsDelivery(_) => WebhookSource::SmsDelivery,
            Self::Review(_) => WebhookSource::ReviewPlatform,
        }
    }

    /// Provider identifier used as the idempotency key.
    ///
    /// Review identifiers are only unique per platform, so the platform is
    /// folded into the key.
    pub fn external_id(&self) -> String {
        match self {
            Self::Telephony(event) => event.call_sid.clone(),
            Self::Calendar(event) => event.id.clone(),
            Self::SmsDelivery(event) => event.message_id.clone(),
            Self::Review(event) => format!("{}:{}", event.platform, event.review_id),
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Decode the wire body into its structural payload.
///
/// Telephony callbacks are form-encoded; every other provider posts JSON.
pub fn decode(source: WebhookSource, raw_body: &[u8]) -> Result<Value, SchemaError> {
    match source {
        WebhookSource::Telephony => {
            let object: Map<String, Value> = url::form_urlencoded::parse(raw_body)
                .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
                .collect();
            if object.is_empty() {
                return Err(SchemaError::new("$", "form body is empty"));
            }
            Ok(Value::Object(object))
        }
        _ => {
            let value: Value = serde_json::from_slice(raw_body)
                .map_err(|e| SchemaError::new("$", format!("body is not valid JSON: {e}")))?;
            if !value.is_object() {
                return Err(SchemaError::new("$", "body must be a JSON object"));
            }
            Ok(value)
        }
    }
}

/// Validate a decoded payload into the envelope for `source`.
pub fn parse(source: WebhookSource, payload: &Value) -> Result<TypedEnvelope, SchemaError> {
    let object = payload
        .as_object()
        .ok_or_else(|| SchemaError::new("$", "payload must be an object"))?;
    let fields = Fields::root(object);

    match source {
        WebhookSource::Telephony => parse_telephony(&fields).map(TypedEnvelope::Telephony),
        WebhookSource::Calendar => parse_calendar(&fields).map(TypedEnvelope::Calendar),
        WebhookSource::SmsDelivery => parse_sms(&fields).map(TypedEnvelope::SmsDelivery),
        WebhookSource::ReviewPlatform => parse_review(&fields).map(TypedEnvelope::Review),
    }
}

fn parse_telephony(fields: &Fields<'_>) -> Result<TelephonyEvent, SchemaError> {
    let call_sid = fields.required_str("CallSid")?;
    let call_status = fields.required_enum("CallStatus", CallStatus::parse, CallStatus::ALLOWED)?;

    let call_duration = match fields.optional_str("CallDuration")? {
        Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
            SchemaError::new(fields.path("CallDuration"), "must be a non-negative integer")
        })?),
        None => None,
    };

    Ok(TelephonyEvent {
        call_sid,
        call_status,
        from: fields.optional_str("From")?,
        to: fields.optional_str("To")?,
        call_duration,
        recording_url: fields.optional_url("RecordingUrl")?,
        transcription_text: fields.optional_str("TranscriptionText")?,
        direction: fields.optional_str("Direction")?,
    })
}

fn parse_calendar(fields: &Fields<'_>) -> Result<CalendarEvent, SchemaError> {
    let id = fields.required_str("id")?;
    let summary = fields.required_str("summary")?;

    let start_fields = fields.required_object("start")?;
    let start = start_fields.required_timestamp("dateTime")?;
    let end_fields = fields.required_object("end")?;
    let end = end_fields.required_timestamp("dateTime")?;
    if end < start {
        return Err(SchemaError::new(
            end_fields.path("dateTime"),
            "must not be before start.dateTime",
        ));
    }

    let status = fields.required_enum(
        "status",
        CalendarEventStatus::parse,
        CalendarEventStatus::ALLOWED,
    )?;

    let mut attendees = Vec::new();
    for (index, attendee) in fields.optional_array("attendees")?.iter().enumerate() {
        let path = format!("{}[{index}]", fields.path("attendees"));
        let object = attendee
            .as_object()
            .ok_or_else(|| SchemaError::new(path.clone(), "must be an object"))?;
        let attendee_fields = Fields::nested(object, path);
        attendees.push(Attendee {
            email: attendee_fields.optional_email("email")?,
            display_name: attendee_fields.optional_str("displayName")?,
            organizer: attendee_fields.optional_bool("organizer")?.unwrap_or(false),
            response_status: attendee_fields.optional_str("responseStatus")?,
        });
    }

    let organizer_email = match fields.optional_object("organizer")? {
        Some(organizer) => organizer.optional_email("email")?,
        None => None,
    };

    Ok(CalendarEvent {
        id,
        summary,
        start,
        end,
        status,
        attendees,
        organizer_email,
        calendar_id: fields.optional_str("calendarId")?,
        description: fields.optional_str("description")?,
        location: fields.optional_str("location")?,
    })
}

fn parse_sms(fields: &Fields<'_>) -> Result<SmsDeliveryEvent, SchemaError> {
    Ok(SmsDeliveryEvent {
        message_id: fields.required_str("messageId")?,
        status: fields.required_enum(
            "status",
            SmsDeliveryStatus::parse,
            SmsDeliveryStatus::ALLOWED,
        )?,
        timestamp: fields.required_timestamp("timestamp")?,
        from: fields.optional_str("from")?,
        to: fields.optional_str("to")?,
        error_code: fields.optional_str("errorCode")?,
        error_message: fields.optional_str("errorMessage")?,
    })
}

fn parse_review(fields: &Fields<'_>) -> Result<ReviewEvent, SchemaError> {
    let review_id = fields.required_str("reviewId")?;
    let business_id = fields.required_str("businessId")?;

    let rating_path = fields.path("reviewRating");
    let rating = match fields.get("reviewRating") {
        None | Some(Value::Null) => return Err(SchemaError::missing(rating_path)),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    let rating = match rating {
        Some(value @ 1..=5) => value as u8,
        _ => {
            return Err(SchemaError::new(
                rating_path,
                "must be an integer between 1 and 5",
            ))
        }
    };

    let platform =
        fields.required_enum("platform", ReviewPlatform::parse, ReviewPlatform::ALLOWED)?;

    let review_date = match fields.optional_str("reviewDate")? {
        Some(raw) => Some(Timestamp::from_rfc3339(&raw).map_err(|_| {
            SchemaError::new(fields.path("reviewDate"), "must be an RFC3339 datetime")
        })?),
        None => None,
    };

    Ok(ReviewEvent {
        review_id,
        business_id,
        rating,
        platform,
        reviewer_name: fields.optional_str("reviewerName")?,
        review_text: fields.optional_str("reviewText")?,
        review_url: fields.optional_url("reviewUrl")?,
        review_date,
    })
}

// ============================================================================
// Field access
// ============================================================================

/// Typed accessors over one JSON object, tracking the path for error messages
struct Fields<'a> {
    object: &'a Map<String, Value>,
    prefix: String,
}

impl<'a> Fields<'a> {
    fn root(object: &'a Map<String, Value>) -> Self {
        Self {
            object,
            prefix: String::new(),
        }
    }

    fn nested(object: &'a Map<String, Value>, prefix: String) -> Self {
        Self { object, prefix }
    }

    fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.object.get(name)
    }

    /// Blank strings count as absent.
    fn optional_str(&self, name: &str) -> Result<Option<String>, SchemaError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(SchemaError::new(self.path(name), "must be a string")),
        }
    }

    fn required_str(&self, name: &str) -> Result<String, SchemaError> {
        self.optional_str(name)?
            .ok_or_else(|| SchemaError::missing(self.path(name)))
    }

    fn required_enum<T>(
        &self,
        name: &str,
        parse: fn(&str) -> Option<T>,
        allowed: &str,
    ) -> Result<T, SchemaError> {
        let raw = self.required_str(name)?;
        parse(&raw).ok_or_else(|| {
            SchemaError::new(
                self.path(name),
                format!("'{raw}' is not one of: {allowed}"),
            )
        })
    }

    fn required_timestamp(&self, name: &str) -> Result<Timestamp, SchemaError> {
        let raw = self.required_str(name)?;
        Timestamp::from_rfc3339(&raw).map_err(|_| {
            SchemaError::new(
                self.path(name),
                "must be an RFC3339 datetime with offset",
            )
        })
    }

    fn optional_email(&self, name: &str) -> Result<Option<String>, SchemaError> {
        match self.optional_str(name)? {
            Some(email) if !looks_like_email(&email) => Err(SchemaError::new(
                self.path(name),
                "must be an email address",
            )),
            other => Ok(other),
        }
    }

    /// Absolute `http` or `https` URL
    fn optional_url(&self, name: &str) -> Result<Option<String>, SchemaError> {
        let Some(raw) = self.optional_str(name)? else {
            return Ok(None);
        };
        match url::Url::parse(&raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(Some(raw)),
            Ok(_) => Err(SchemaError::new(self.path(name), "must be an http or https URL")),
            Err(e) => Err(SchemaError::new(self.path(name), format!("must be a URL: {e}"))),
        }
    }

    fn optional_bool(&self, name: &str) -> Result<Option<bool>, SchemaError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(SchemaError::new(self.path(name), "must be a boolean")),
        }
    }

    fn optional_array(&self, name: &str) -> Result<&'a [Value], SchemaError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(&[]),
            Some(Value::Array(items)) => Ok(items.as_slice()),
            Some(_) => Err(SchemaError::new(self.path(name), "must be an array")),
        }
    }

    fn optional_object(&self, name: &str) -> Result<Option<Fields<'a>>, SchemaError> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(object)) => Ok(Some(Fields::nested(object, self.path(name)))),
            Some(_) => Err(SchemaError::new(self.path(name), "must be an object")),
        }
    }

    fn required_object(&self, name: &str) -> Result<Fields<'a>, SchemaError> {
        self.optional_object(name)?
            .ok_or_else(|| SchemaError::missing(self.path(name)))
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
