//! Core data model: the CNAB transaction record, the persisted `Transaction`
//! row, and the `FileUpload` aggregate root that drives the ingestion state
//! machine described in `storage::registry`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the nine CNAB transaction type codes. The numeric code doubles as
/// `bankCode` per spec §3 (Open Question: treated as distinct fields,
/// populated with the same value until the source separates them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Debit = 1,
    Boleto = 2,
    Financing = 3,
    Credit = 4,
    LoanReceipt = 5,
    Sales = 6,
    TedReceipt = 7,
    DocReceipt = 8,
    Rent = 9,
}

impl TransactionType {
    pub fn from_code(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(Self::Debit),
            b'2' => Some(Self::Boleto),
            b'3' => Some(Self::Financing),
            b'4' => Some(Self::Credit),
            b'5' => Some(Self::LoanReceipt),
            b'6' => Some(Self::Sales),
            b'7' => Some(Self::TedReceipt),
            b'8' => Some(Self::DocReceipt),
            b'9' => Some(Self::Rent),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        (b'0' + self as u8) as char
    }

    /// Sign applied to `amount` when accumulating a balance.
    pub fn sign(self) -> i64 {
        match self {
            Self::Debit
            | Self::Credit
            | Self::LoanReceipt
            | Self::Sales
            | Self::TedReceipt
            | Self::DocReceipt => 1,
            Self::Boleto | Self::Financing | Self::Rent => -1,
        }
    }

    pub fn nature(self) -> &'static str {
        match self {
            Self::Debit => "Debit",
            Self::Boleto => "Boleto",
            Self::Financing => "Financing",
            Self::Credit => "Credit",
            Self::LoanReceipt => "Loan receipt",
            Self::Sales => "Sales",
            Self::TedReceipt => "TED receipt",
            Self::DocReceipt => "DOC receipt",
            Self::Rent => "Rent",
        }
    }
}

/// Non-negative fixed-point amount, scale 2 (integer cents). Avoids pulling
/// in a decimal crate the teacher doesn't use: CNAB amounts are already
/// integer cents on the wire, so a plain `u64` newtype round-trips exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cents(pub u64);

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Wall-clock time-of-day expressed as seconds since midnight, *not*
/// wrapped modulo 24h. The CNAB `HHMMSS` field is parsed as `h` hours + `m`
/// minutes + `s` seconds with none of the three range-checked — the source
/// format silently accepts `H >= 24` (and non-canonical minutes/seconds)
/// and treats the result as a plain duration-since-midnight rather than a
/// calendar time-of-day. Preserved verbatim; see spec §4.1 and §8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayTime(pub i64);

impl DayTime {
    pub fn from_hms(h: u32, m: u32, s: u32) -> Self {
        Self((h as i64) * 3600 + (m as i64) * 60 + (s as i64))
    }
}

impl fmt::Display for DayTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.0 / 3600;
        let m = (self.0 % 3600) / 60;
        let s = self.0 % 60;
        write!(f, "{h:02}:{m:02}:{s:02}")
    }
}

/// Decoded CNAB line, before or after persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_type: TransactionType,
    pub transaction_date: NaiveDate,
    pub transaction_time: DayTime,
    pub amount: Cents,
    pub cpf: String,
    pub card: String,
    pub store_owner: String,
    pub store_name: String,
    pub bank_code: TransactionType,
}

/// A persisted `Transaction` row: one per successfully processed CNAB line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub idempotency_key: String,
    pub file_upload_id: Option<String>,
    pub record: TransactionRecord,
}

/// Lifecycle status of a `FileUpload` aggregate. Matches the state graph in
/// spec §4.4 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Duplicate,
    PartiallyCompleted,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Duplicate | Self::PartiallyCompleted
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Duplicate => "Duplicate",
            Self::PartiallyCompleted => "PartiallyCompleted",
        };
        write!(f, "{s}")
    }
}

/// Aggregate root of the ingestion pipeline. See spec §3 for field-by-field
/// semantics and invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpload {
    pub id: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_size: u64,
    pub storage_path: String,
    pub status: UploadStatus,
    pub total_line_count: Option<u64>,
    pub processed_line_count: u64,
    pub failed_line_count: u64,
    pub skipped_line_count: u64,
    pub last_checkpoint_line: Option<u64>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl FileUpload {
    pub fn progress_percentage(&self) -> f64 {
        match self.total_line_count {
            Some(total) if total > 0 => {
                let done = self.processed_line_count + self.failed_line_count + self.skipped_line_count;
                100.0 * (done as f64) / (total as f64)
            }
            _ => 0.0,
        }
    }

    /// Sum of processed + failed + skipped, the `Σ` of spec §4.4.
    pub fn sigma(&self) -> u64 {
        self.processed_line_count + self.failed_line_count + self.skipped_line_count
    }
}

/// Outcome of processing a single line, returned by `LineWorker` to the
/// engine so it can increment the right counter (spec §4.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Processed,
    Failed,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for c in b'1'..=b'9' {
            let t = TransactionType::from_code(c).unwrap();
            assert_eq!(t.code() as u8, c);
        }
        assert!(TransactionType::from_code(b'0').is_none());
        assert!(TransactionType::from_code(b'X').is_none());
    }

    #[test]
    fn signs_match_spec_table() {
        assert_eq!(TransactionType::Debit.sign(), 1);
        assert_eq!(TransactionType::Boleto.sign(), -1);
        assert_eq!(TransactionType::Financing.sign(), -1);
        assert_eq!(TransactionType::Credit.sign(), 1);
        assert_eq!(TransactionType::LoanReceipt.sign(), 1);
        assert_eq!(TransactionType::Sales.sign(), 1);
        assert_eq!(TransactionType::TedReceipt.sign(), 1);
        assert_eq!(TransactionType::DocReceipt.sign(), 1);
        assert_eq!(TransactionType::Rent.sign(), -1);
    }

    #[test]
    fn cents_display() {
        assert_eq!(Cents(14200).to_string(), "142.00");
        assert_eq!(Cents(1).to_string(), "0.01");
    }

    #[test]
    fn progress_percentage_zero_total() {
        let upload = FileUpload {
            id: "u1".into(),
            file_name: "20190301120000".into(),
            file_hash: "h".into(),
            file_size: 0,
            storage_path: String::new(),
            status: UploadStatus::Pending,
            total_line_count: None,
            processed_line_count: 0,
            failed_line_count: 0,
            skipped_line_count: 0,
            last_checkpoint_line: None,
            last_checkpoint_at: None,
            processing_started_at: None,
            processing_completed_at: None,
            uploaded_at: Utc::now(),
            retry_count: 0,
            error_message: None,
        };
        assert_eq!(upload.progress_percentage(), 0.0);
    }
}
