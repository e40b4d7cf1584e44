//! Core domain model for the OFC listing catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ofc-core";

/// Constant prefix carried by every issued listing id.
pub const LISTING_ID_PREFIX: &str = "OF";
/// Zero-padded width of the sequence part of a listing id.
pub const LISTING_ID_DIGITS: usize = 7;

/// Format a sequence number as a catalog listing id, e.g. `OF0000042`.
///
/// Ids are fixed-width and zero-padded, so lexicographic order over issued
/// ids equals assignment order.
pub fn format_listing_id(sequence: u64) -> String {
    format!("{LISTING_ID_PREFIX}{sequence:0width$}", width = LISTING_ID_DIGITS)
}

/// Recover the sequence number from an issued listing id.
///
/// Returns `None` for anything that does not look like an issued id; callers
/// treat that as "no sequence to reconcile against", never as an error.
pub fn parse_listing_sequence(listing_id: &str) -> Option<u64> {
    let digits = listing_id.strip_prefix(LISTING_ID_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// A normalized listing as handed over by the harvest boundary, before an
/// id has been issued for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub business_name: String,
    pub city: String,
    pub province_id: String,
    pub province_name: String,
    pub country: String,
    pub currency: String,
    pub founded_year: u32,
    pub images: Vec<String>,
    pub industry: Vec<String>,
    pub long_description: String,
    pub short_description: String,
    pub number_of_employees: u32,
    pub price: i64,
    pub profit: i64,
    pub revenue: i64,
    pub seller_name: String,
    pub seller_email: String,
    pub seller_phone: String,
    pub source: String,
    pub source_url: String,
    pub listing_url: String,
    pub source_listing_id: String,
    pub date_scraped: DateTime<Utc>,
}

impl Default for ListingDraft {
    fn default() -> Self {
        Self {
            business_name: String::new(),
            city: String::new(),
            province_id: String::new(),
            province_name: String::new(),
            country: String::new(),
            currency: String::new(),
            founded_year: 0,
            images: Vec::new(),
            industry: Vec::new(),
            long_description: String::new(),
            short_description: String::new(),
            number_of_employees: 0,
            price: 0,
            profit: 0,
            revenue: 0,
            seller_name: String::new(),
            seller_email: String::new(),
            seller_phone: String::new(),
            source: String::new(),
            source_url: String::new(),
            listing_url: String::new(),
            source_listing_id: String::new(),
            date_scraped: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl ListingDraft {
    /// Promote the draft into a catalog record under a freshly issued id.
    pub fn into_record(self, listing_id: String) -> ListingRecord {
        ListingRecord {
            listing_id,
            business_name: self.business_name,
            city: self.city,
            province_id: self.province_id,
            province_name: self.province_name,
            country: self.country,
            currency: self.currency,
            founded_year: self.founded_year,
            images: self.images,
            industry: self.industry,
            long_description: self.long_description,
            short_description: self.short_description,
            number_of_employees: self.number_of_employees,
            price: self.price,
            profit: self.profit,
            revenue: self.revenue,
            seller_name: self.seller_name,
            seller_email: self.seller_email,
            seller_phone: self.seller_phone,
            source: self.source,
            source_url: self.source_url,
            listing_url: self.listing_url,
            source_listing_id: self.source_listing_id,
            date_scraped: self.date_scraped,
        }
    }
}

/// Canonical persisted listing. Append-only: created once by the merge
/// step, never updated or deleted afterwards.
///
/// Every field is defaulted on deserialization so a malformed stored
/// document coerces instead of failing the whole catalog fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingRecord {
    /// Issued id, unique and immutable once set. `business_name` is the
    /// identity key the merge step dedups on.
    pub listing_id: String,
    pub business_name: String,
    pub city: String,
    pub province_id: String,
    pub province_name: String,
    pub country: String,
    pub currency: String,
    pub founded_year: u32,
    pub images: Vec<String>,
    pub industry: Vec<String>,
    pub long_description: String,
    pub short_description: String,
    pub number_of_employees: u32,
    pub price: i64,
    pub profit: i64,
    pub revenue: i64,
    pub seller_name: String,
    pub seller_email: String,
    pub seller_phone: String,
    pub source: String,
    pub source_url: String,
    pub listing_url: String,
    pub source_listing_id: String,
    pub date_scraped: DateTime<Utc>,
}

impl Default for ListingRecord {
    fn default() -> Self {
        ListingDraft::default().into_record(String::new())
    }
}

/// Singleton catalog bookkeeping document.
///
/// Invariant: `count == last_sequence ==` number of records bearing an
/// issued id (the catalog is append-only and ids are issued 1..=N).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogMeta {
    pub last_sequence: u64,
    pub last_id: String,
    pub count: u64,
}

/// One grouping bucket of the province/city/industry projections.
///
/// A disposable projection: the whole bucket set is recomputed and
/// rewritten on every catalog mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateBucket {
    pub name: String,
    pub count: u64,
    pub image: String,
}

/// Statistical summary of one monitored numeric field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSummary {
    pub key: String,
    pub min: i64,
    pub max: i64,
    pub sum: i64,
    pub count: u64,
    pub avg: i64,
    pub bucket_width: i64,
}

/// One frequency bucket covering the half-open range `[lower, upper)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramBucket {
    pub lower: i64,
    pub upper: i64,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_ids_are_prefixed_and_zero_padded() {
        assert_eq!(format_listing_id(1), "OF0000001");
        assert_eq!(format_listing_id(1234567), "OF1234567");
    }

    #[test]
    fn listing_id_order_matches_assignment_order() {
        let earlier = format_listing_id(99);
        let later = format_listing_id(100);
        assert!(earlier < later);
    }

    #[test]
    fn sequence_round_trips_through_formatting() {
        for sequence in [1u64, 42, 9_999_999] {
            assert_eq!(parse_listing_sequence(&format_listing_id(sequence)), Some(sequence));
        }
    }

    #[test]
    fn sequence_parsing_rejects_foreign_ids() {
        assert_eq!(parse_listing_sequence(""), None);
        assert_eq!(parse_listing_sequence("OF"), None);
        assert_eq!(parse_listing_sequence("OFxxxxxxx"), None);
        assert_eq!(parse_listing_sequence("A139627-4"), None);
    }

    #[test]
    fn draft_promotion_assigns_id_and_keeps_fields() {
        let draft = ListingDraft {
            business_name: "Harbourview Marina".to_string(),
            price: 750_000,
            industry: vec!["Tourism".to_string()],
            ..ListingDraft::default()
        };
        let record = draft.into_record(format_listing_id(7));
        assert_eq!(record.listing_id, "OF0000007");
        assert_eq!(record.business_name, "Harbourview Marina");
        assert_eq!(record.price, 750_000);
        assert_eq!(record.industry, vec!["Tourism".to_string()]);
    }

    #[test]
    fn stored_documents_coerce_instead_of_rejecting() {
        let record: ListingRecord = serde_json::from_str(
            r#"{"listing_id":"OF0000003","business_name":"Lakeside Bakery"}"#,
        )
        .expect("partial document deserializes");
        assert_eq!(record.price, 0);
        assert_eq!(record.city, "");
        assert!(record.images.is_empty());
        assert_eq!(record.date_scraped, chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    }
}
