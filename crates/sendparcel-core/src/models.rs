//! Domain models and strongly-typed identifiers.
//!
//! Defines the shipment view the callback pipeline reads, the durable retry
//! record for failed callbacks, and newtype ID wrappers with database
//! encoding so repositories can bind them directly.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed shipment identifier.
///
/// Shipments are owned by the external shipment flow; this crate only ever
/// looks them up and reports their status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShipmentId(pub Uuid);

impl ShipmentId {
    /// Creates a new random shipment ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ShipmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ShipmentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ShipmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl sqlx::Type<PgDb> for ShipmentId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ShipmentId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ShipmentId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed retry record identifier.
///
/// Assigned when a failed callback is enqueued and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryId(pub Uuid);

impl RetryId {
    /// Creates a new random retry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RetryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RetryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RetryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for RetryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RetryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for RetryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identifies one claim on a retry record.
///
/// Every claim issues a fresh token. Mutations that present a token only
/// apply while the record is still held under that same claim, so a sweep
/// whose lease lapsed cannot overwrite the work of the sweep that
/// reclaimed the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    /// Creates a new random claim token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for ClaimToken {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ClaimToken {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for ClaimToken {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Shipment lifecycle status as reported by the shipment flow.
///
/// ```text
/// New -> Created -> LabelReady -> InTransit -> OutForDelivery -> Delivered
///                                     |               |
///                                     +---------------+--> Returned
/// New | Created | LabelReady --> Cancelled
/// any non-terminal state --> Failed
/// ```
///
/// Forward moves along the delivery path may skip steps, since providers do
/// not report every intermediate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    /// Recorded locally, not yet registered with the provider.
    New,
    /// Registered with the provider.
    Created,
    /// Label generated and available for download.
    LabelReady,
    /// Picked up by the carrier.
    InTransit,
    /// On the last-mile vehicle.
    OutForDelivery,
    /// Handed over to the receiver.
    Delivered,
    /// Cancelled before delivery.
    Cancelled,
    /// Provider reported an unrecoverable problem.
    Failed,
    /// Sent back to the sender.
    Returned,
}

impl ShipmentStatus {
    /// Returns true when the shipment can no longer change status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled | Self::Failed | Self::Returned)
    }

    /// Returns true when a shipment in this status may move to `next`.
    ///
    /// Staying in the same status is not a transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Cancelled => matches!(self, Self::New | Self::Created | Self::LabelReady),
            Self::Returned => matches!(self, Self::InTransit | Self::OutForDelivery),
            _ => next.delivery_step() > self.delivery_step(),
        }
    }

    const fn delivery_step(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Created => 1,
            Self::LabelReady => 2,
            Self::InTransit => 3,
            Self::OutForDelivery => 4,
            Self::Delivered => 5,
            Self::Cancelled | Self::Failed | Self::Returned => u8::MAX,
        }
    }

    /// Returns the wire/database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Created => "created",
            Self::LabelReady => "label_ready",
            Self::InTransit => "in_transit",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Returned => "returned",
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "created" => Ok(Self::Created),
            "label_ready" => Ok(Self::LabelReady),
            "in_transit" => Ok(Self::InTransit),
            "out_for_delivery" => Ok(Self::OutForDelivery),
            "delivered" => Ok(Self::Delivered),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "returned" => Ok(Self::Returned),
            _ => Err(format!("invalid shipment status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for ShipmentStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ShipmentStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// Shipment as seen by the callback pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shipment {
    /// Unique identifier.
    pub id: ShipmentId,

    /// Slug of the provider integration that owns this shipment.
    pub provider: String,

    /// Current lifecycle status.
    pub status: ShipmentStatus,

    /// Identifier assigned by the provider.
    pub external_id: String,

    /// Carrier tracking number.
    pub tracking_number: String,

    /// Where the label can be downloaded from.
    pub label_url: String,

    /// When the shipment was recorded.
    pub created_at: DateTime<Utc>,

    /// When the shipment last changed.
    pub updated_at: DateTime<Utc>,
}

impl Shipment {
    /// Builds a fresh shipment owned by `provider`.
    pub fn new(provider: impl Into<String>, status: ShipmentStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: ShipmentId::new(),
            provider: provider.into(),
            status,
            external_id: String::new(),
            tracking_number: String::new(),
            label_url: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Retry record lifecycle status.
///
/// ```text
/// Pending -> Processing -> Succeeded
///    ^            |
///    +------------+ (failed attempt, released claim)
///                 |
///                 +-> Exhausted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Waiting for `next_retry_at`; never tried or tried and eligible again.
    Pending,

    /// Claimed by a sweep until `claimed_until`.
    Processing,

    /// Replay applied successfully. Terminal.
    Succeeded,

    /// Attempt budget used up, or the callback can never succeed. Terminal.
    Exhausted,
}

impl RetryStatus {
    /// Returns true for `Succeeded` and `Exhausted`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

impl sqlx::Type<PgDb> for RetryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RetryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "exhausted" => Ok(Self::Exhausted),
            _ => Err(format!("invalid retry status: {s}").into()),
        }
    }
}

/// A failed callback delivery queued for replay.
///
/// The payload and headers are kept exactly as received so a replay can
/// re-verify signatures against them.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryRecord {
    /// Unique identifier.
    pub id: RetryId,

    /// Shipment the callback pertains to.
    pub shipment_id: ShipmentId,

    /// Provider integration that produced the callback.
    pub provider_slug: String,

    /// Original callback body.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Original callback headers.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Failed attempts so far.
    pub attempts: i32,

    /// Current status.
    pub status: RetryStatus,

    /// Earliest time a sweep may pick the record up.
    pub next_retry_at: DateTime<Utc>,

    /// Lease expiry while `Processing`.
    pub claimed_until: Option<DateTime<Utc>>,

    /// Claim currently holding the record while `Processing`.
    pub claim_token: Option<ClaimToken>,

    /// Most recent failure reason.
    pub last_error: Option<String>,

    /// When the record was enqueued.
    pub created_at: DateTime<Utc>,
}

impl RetryRecord {
    /// Projects the fields a replay needs.
    pub fn view(&self) -> RetryView {
        RetryView {
            id: self.id,
            shipment_id: self.shipment_id,
            provider_slug: self.provider_slug.clone(),
            payload: self.payload.0.clone(),
            headers: self.headers.0.clone(),
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            claim: self.claim_token,
        }
    }
}

/// The subset of a retry record handed to a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryView {
    /// Record identifier.
    pub id: RetryId,
    /// Shipment the callback pertains to.
    pub shipment_id: ShipmentId,
    /// Provider integration that produced the callback.
    pub provider_slug: String,
    /// Original callback body.
    pub payload: serde_json::Value,
    /// Original callback headers.
    pub headers: HashMap<String, String>,
    /// Failed attempts before this pass.
    pub attempts: u32,
    /// Claim the record was handed out under; `None` for read-only listings
    /// of pending records.
    pub claim: Option<ClaimToken>,
}
