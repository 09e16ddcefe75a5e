use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::model::{Currency, RateRecord};

/// How a failed extraction step should be handled by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Element not ready in time, stale page, bad response. Worth retrying
    /// on the same session.
    Transient,
    /// The session itself is unusable (driver gone, connection refused).
    /// Retrying only makes sense on a fresh session.
    SessionFatal,
}

#[derive(Debug)]
pub struct ExtractionError {
    kind: FailureKind,
    message: String,
}

impl ExtractionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn session_fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::SessionFatal,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_session_fatal(&self) -> bool {
        self.kind == FailureKind::SessionFatal
    }
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExtractionError {}

/// Handle to one hotel in a search result list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultItem {
    pub hotel_name: String,
    pub detail_url: String,
}

/// Rate records grouped by the room they were observed under; the entry key
/// needs the room name, so extraction reports it alongside the records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRates {
    pub room_name: String,
    pub rates: Vec<RateRecord>,
}

/// Everything a worker needs from a page, with all DOM knowledge behind it.
/// Every operation is bounded by the implementation's own timeouts; a caller
/// never waits forever.
#[async_trait]
pub trait ExtractionClient: Send {
    async fn navigate_to_search(
        &mut self,
        city: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
        corporate_code: Option<&str>,
    ) -> Result<(), ExtractionError>;

    async fn accept_consent_if_present(&mut self) -> Result<(), ExtractionError>;

    async fn list_result_items(&mut self) -> Result<Vec<ResultItem>, ExtractionError>;

    async fn open_item(&mut self, item: &ResultItem) -> Result<(), ExtractionError>;

    async fn set_currency(&mut self, currency: Currency) -> Result<(), ExtractionError>;

    async fn extract_rate_records(&mut self) -> Result<Vec<RoomRates>, ExtractionError>;
}

/// Creates fresh sessions for a worker. Tearing a session down is dropping
/// it; a replacement always starts from a clean slate (empty cookie jar,
/// empty cache).
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self) -> Result<Box<dyn ExtractionClient>, ExtractionError>;
}
