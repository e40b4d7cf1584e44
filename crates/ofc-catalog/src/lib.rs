//! Merge and rebuild core of the listing catalog.
//!
//! One logical run per invocation: collect a harvest batch, merge it into
//! the append-only catalog under freshly issued ids, and recompute every
//! derived projection (province/city/industry aggregates and the
//! per-field histograms) from the post-merge snapshot. The rebuild only
//! happens when the merge actually added something.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ofc_core::{
    format_listing_id, parse_listing_sequence, AggregateBucket, CatalogMeta, HistogramBucket,
    ListingDraft, ListingRecord, MetricSummary,
};
use ofc_source::{RawRecordSource, SourceError};
use ofc_store::{DocumentStore, StoreError};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ofc-catalog";

/// Target resolution of every histogram: `bucket_width` is chosen so the
/// value range divides into about this many buckets.
pub const HISTOGRAM_STEP_COUNT: i64 = 50;

/// Collection layout of the catalog store. Every projection writes to its
/// own collection so the rebuild stages never contend.
pub mod collections {
    pub const LISTINGS: &str = "listings";
    pub const META: &str = "meta";
    pub const META_DOC: &str = "meta";
    pub const PROVINCE: &str = "meta_province";
    pub const CITY: &str = "meta_city";
    pub const INDUSTRY: &str = "meta_industry";
    pub const HISTOGRAM_META: &str = "hist_meta";
    pub const HISTOGRAM_PRICE: &str = "hist_price";
    pub const HISTOGRAM_REVENUE: &str = "hist_revenue";
    pub const HISTOGRAM_PROFIT: &str = "hist_profit";
    pub const HISTOGRAM_BUSINESS_SIZE: &str = "hist_bs";
}

/// Placeholder pool for aggregate buckets whose listings carry no photos.
pub const PLACEHOLDER_IMAGES: [&str; 20] = [
    "https://www.acquizition.biz/prod/photos/A139627-4.jpg",
    "https://www.acquizition.biz/prod/photos/A140129-4.jpg",
    "https://www.acquizition.biz/prod/photos/A139885-6.jpg",
    "https://www.acquizition.biz/prod/photos/A139811-5.jpg",
    "https://www.acquizition.biz/prod/photos/A140048-3.jpg",
    "https://www.acquizition.biz/prod/photos/A140049-4.jpg",
    "https://www.acquizition.biz/prod/photos/A140214-3.jpg",
    "https://www.acquizition.biz/prod/photos/A132070-3.jpg",
    "https://www.acquizition.biz/prod/photos/A132068-3.jpg",
    "https://www.acquizition.biz/prod/photos/A140194-4.jpg",
    "https://www.acquizition.biz/prod/photos/A140165-6.jpg",
    "https://www.acquizition.biz/prod/photos/A140177-6.jpg",
    "https://www.acquizition.biz/prod/photos/A140161-6.jpg",
    "https://www.acquizition.biz/prod/photos/A140121-5.jpg",
    "https://www.acquizition.biz/prod/photos/A140160-6.jpg",
    "https://www.acquizition.biz/prod/photos/A138937-5.jpg",
    "https://www.acquizition.biz/prod/photos/A138937-3.jpg",
    "https://www.acquizition.biz/prod/photos/A140106-5.jpg",
    "https://www.acquizition.biz/prod/photos/A140007-4.jpg",
    "https://www.acquizition.biz/prod/photos/A138187-5.jpg",
];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("collecting raw records: {0}")]
    Source(#[from] SourceError),
    #[error("store failure during {stage}: {source}")]
    Store {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("encoding {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn at_stage(stage: &'static str) -> impl FnOnce(StoreError) -> PipelineError {
    move |source| PipelineError::Store { stage, source }
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value).map_err(|source| PipelineError::Encode { what, source })
}

/// Decode the catalog snapshot, coercing rather than rejecting: a
/// document that is not even an object is skipped with a warning instead
/// of failing the run.
fn decode_records(documents: Vec<Value>) -> Vec<ListingRecord> {
    let mut records = Vec::with_capacity(documents.len());
    for document in documents {
        match serde_json::from_value::<ListingRecord>(document) {
            Ok(record) => records.push(record),
            Err(err) => warn!(error = %err, "skipping undecodable catalog document"),
        }
    }
    records
}

pub async fn fetch_catalog(store: &dyn DocumentStore) -> Result<Vec<ListingRecord>, PipelineError> {
    let documents = store
        .fetch_all(collections::LISTINGS)
        .await
        .map_err(at_stage("catalog fetch"))?;
    Ok(decode_records(documents))
}

pub async fn fetch_meta(store: &dyn DocumentStore) -> Result<CatalogMeta, PipelineError> {
    let document = store
        .get(collections::META, collections::META_DOC)
        .await
        .map_err(at_stage("meta fetch"))?;
    Ok(document
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default())
}

/// Owner of the issued-id sequence for one pipeline run.
///
/// Ids are issued in memory and the counter is only written back by
/// [`IdentityAllocator::commit`], gated on the dirty flag, so a batch
/// that adds nothing leaves the persisted counter untouched.
#[derive(Debug)]
pub struct IdentityAllocator {
    meta: CatalogMeta,
    dirty: bool,
}

impl IdentityAllocator {
    /// Reconcile the persisted counter against the catalog snapshot.
    ///
    /// A run that died between writing records and committing the counter
    /// leaves ids in the catalog beyond `last_sequence`; starting from the
    /// highest id actually present means those sequences are never issued
    /// a second time.
    pub fn reconciled(mut meta: CatalogMeta, catalog: &[ListingRecord]) -> Self {
        let highest_assigned = catalog
            .iter()
            .filter_map(|record| parse_listing_sequence(&record.listing_id))
            .max()
            .unwrap_or(0);
        if highest_assigned > meta.last_sequence {
            warn!(
                persisted = meta.last_sequence,
                highest_assigned, "catalog holds ids beyond the persisted counter; reconciling"
            );
            meta.last_sequence = highest_assigned;
            meta.last_id = format_listing_id(highest_assigned);
        }
        meta.count = catalog.len() as u64;
        Self { meta, dirty: false }
    }

    /// Issue the next id in sequence.
    pub fn issue(&mut self) -> String {
        self.meta.last_sequence += 1;
        self.meta.count += 1;
        self.meta.last_id = format_listing_id(self.meta.last_sequence);
        self.dirty = true;
        self.meta.last_id.clone()
    }

    pub fn meta(&self) -> &CatalogMeta {
        &self.meta
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist the counter. A run that issued nothing writes nothing.
    pub async fn commit(&self, store: &dyn DocumentStore) -> Result<(), PipelineError> {
        if !self.dirty {
            return Ok(());
        }
        let document = encode("catalog meta", &self.meta)?;
        store
            .upsert(collections::META, collections::META_DOC, document)
            .await
            .map_err(at_stage("meta commit"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub scanned: usize,
    pub added: usize,
    pub dirty: bool,
}

/// Merge a harvest batch into the catalog.
///
/// Strictly sequential: each draft dedups against everything already in
/// the snapshot, including records added earlier in the same batch. A
/// rescraped listing whose business name is already known is discarded,
/// never used to update the existing entry.
pub async fn merge_batch(
    store: &dyn DocumentStore,
    allocator: &mut IdentityAllocator,
    catalog: &mut Vec<ListingRecord>,
    batch: Vec<ListingDraft>,
) -> Result<MergeOutcome, PipelineError> {
    let mut by_name: HashMap<String, usize> = catalog
        .iter()
        .enumerate()
        .map(|(index, record)| (record.business_name.clone(), index))
        .collect();

    let scanned = batch.len();
    let mut added = 0usize;
    for draft in batch {
        if by_name.contains_key(&draft.business_name) {
            continue;
        }

        let listing_id = allocator.issue();
        let record = draft.into_record(listing_id.clone());
        let document = encode("listing record", &record)?;
        store
            .upsert(collections::LISTINGS, &listing_id, document)
            .await
            .map_err(at_stage("listing insert"))?;

        by_name.insert(record.business_name.clone(), catalog.len());
        catalog.push(record);
        added += 1;
    }

    Ok(MergeOutcome {
        scanned,
        added,
        dirty: added > 0,
    })
}

/// The three grouping projections derived from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDimension {
    Province,
    City,
    Industry,
}

impl GroupDimension {
    pub const ALL: [GroupDimension; 3] = [
        GroupDimension::Province,
        GroupDimension::City,
        GroupDimension::Industry,
    ];

    pub fn collection(self) -> &'static str {
        match self {
            GroupDimension::Province => collections::PROVINCE,
            GroupDimension::City => collections::CITY,
            GroupDimension::Industry => collections::INDUSTRY,
        }
    }

    fn stage(self) -> &'static str {
        match self {
            GroupDimension::Province => "province rebuild",
            GroupDimension::City => "city rebuild",
            GroupDimension::Industry => "industry rebuild",
        }
    }
}

/// The grouping keys one record contributes to a dimension. Provinces and
/// cities contribute at most one key; a record feeds one industry bucket
/// per distinct entry of its industry set, repeats collapsing to one.
fn bucket_keys(record: &ListingRecord, dimension: GroupDimension) -> Vec<&str> {
    match dimension {
        GroupDimension::Province => vec![record.province_name.as_str()],
        GroupDimension::City => vec![record.city.as_str()],
        GroupDimension::Industry => {
            let mut seen = HashSet::new();
            record
                .industry
                .iter()
                .map(String::as_str)
                .filter(|key| seen.insert(*key))
                .collect()
        }
    }
}

/// Single counting pass over the catalog for one dimension.
///
/// Buckets come out in first-seen order; the representative image is the
/// first non-empty image URL encountered for the bucket in catalog
/// iteration order and is never replaced once set.
pub fn build_buckets(catalog: &[ListingRecord], dimension: GroupDimension) -> Vec<AggregateBucket> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<AggregateBucket> = Vec::new();

    for record in catalog {
        let first_image = record
            .images
            .iter()
            .find(|url| !url.is_empty())
            .cloned()
            .unwrap_or_default();

        for key in bucket_keys(record, dimension) {
            if key.is_empty() {
                continue;
            }
            match index.get(key) {
                Some(&at) => {
                    buckets[at].count += 1;
                    if buckets[at].image.is_empty() && !first_image.is_empty() {
                        buckets[at].image = first_image.clone();
                    }
                }
                None => {
                    index.insert(key.to_string(), buckets.len());
                    buckets.push(AggregateBucket {
                        name: key.to_string(),
                        count: 1,
                        image: first_image.clone(),
                    });
                }
            }
        }
    }

    buckets
}

/// Cosmetic backfill for buckets that finished the counting pass without
/// an image: pick uniformly from the placeholder pool. Kept apart from
/// the counting pass so a missing photo never influences counts.
pub fn backfill_images<R: Rng + ?Sized>(buckets: &mut [AggregateBucket], rng: &mut R) {
    for bucket in buckets {
        if bucket.image.is_empty() {
            let pick = rng.random_range(0..PLACEHOLDER_IMAGES.len());
            bucket.image = PLACEHOLDER_IMAGES[pick].to_string();
        }
    }
}

/// Recompute one aggregate dimension and replace its collection.
pub async fn rebuild_dimension(
    store: &dyn DocumentStore,
    catalog: &[ListingRecord],
    dimension: GroupDimension,
) -> Result<usize, PipelineError> {
    let mut buckets = build_buckets(catalog, dimension);
    backfill_images(&mut buckets, &mut rand::rng());

    let mut documents = Vec::with_capacity(buckets.len());
    for bucket in &buckets {
        documents.push((bucket.name.clone(), encode("aggregate bucket", bucket)?));
    }

    let collection = dimension.collection();
    store
        .delete_all(collection)
        .await
        .map_err(at_stage(dimension.stage()))?;
    store
        .upsert_many(collection, documents)
        .await
        .map_err(at_stage(dimension.stage()))?;

    info!(collection, buckets = buckets.len(), "aggregate collection rebuilt");
    Ok(buckets.len())
}

/// The numeric fields the histogram projections track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    Price,
    Revenue,
    Profit,
    BusinessSize,
}

impl MetricField {
    pub const ALL: [MetricField; 4] = [
        MetricField::Price,
        MetricField::Revenue,
        MetricField::Profit,
        MetricField::BusinessSize,
    ];

    pub fn key(self) -> &'static str {
        match self {
            MetricField::Price => "price",
            MetricField::Revenue => "revenue",
            MetricField::Profit => "profit",
            MetricField::BusinessSize => "business_size",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            MetricField::Price => collections::HISTOGRAM_PRICE,
            MetricField::Revenue => collections::HISTOGRAM_REVENUE,
            MetricField::Profit => collections::HISTOGRAM_PROFIT,
            MetricField::BusinessSize => collections::HISTOGRAM_BUSINESS_SIZE,
        }
    }

    pub fn value_of(self, record: &ListingRecord) -> i64 {
        match self {
            MetricField::Price => record.price,
            MetricField::Revenue => record.revenue,
            MetricField::Profit => record.profit,
            MetricField::BusinessSize => i64::from(record.number_of_employees),
        }
    }
}

/// Min/max/sum/avg over the whole catalog for one field. Every record
/// participates, zero values included; `count` is the catalog size.
pub fn summarize(catalog: &[ListingRecord], field: MetricField) -> MetricSummary {
    let mut min = 0i64;
    let mut max = 0i64;
    let mut sum = 0i64;
    for (at, record) in catalog.iter().enumerate() {
        let value = field.value_of(record);
        sum += value;
        if at == 0 {
            min = value;
            max = value;
        } else {
            min = min.min(value);
            max = max.max(value);
        }
    }

    let count = catalog.len() as u64;
    // Floored average, 0 for an empty catalog.
    let avg = if count == 0 { 0 } else { sum.div_euclid(count as i64) };
    let bucket_width = ceil_div(max - min, HISTOGRAM_STEP_COUNT);

    MetricSummary {
        key: field.key().to_string(),
        min,
        max,
        sum,
        count,
        avg,
        bucket_width,
    }
}

// max >= min and the step count is positive, so plain adjusted division
// is a correct ceiling here.
fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator - 1) / denominator
}

/// Generate the empty bucket sequence for a summary.
///
/// Lower bounds step from `min` while `lower <= max`, each bucket
/// covering `[lower, lower + width)`. The inclusive stepping condition
/// guarantees a final bucket whose range contains `max`, so the maximum
/// value is never dropped by the half-open ranges. A degenerate summary
/// (`max == min`, width 0) gets exactly one zero-width bucket instead of
/// stepping, which would never terminate.
pub fn build_histogram(summary: &MetricSummary) -> Vec<HistogramBucket> {
    if summary.count == 0 {
        return Vec::new();
    }
    if summary.bucket_width == 0 {
        return vec![HistogramBucket {
            lower: summary.min,
            upper: summary.min,
            count: 0,
        }];
    }

    let mut buckets = Vec::new();
    let mut lower = summary.min;
    while lower <= summary.max {
        buckets.push(HistogramBucket {
            lower,
            upper: lower + summary.bucket_width,
            count: 0,
        });
        lower += summary.bucket_width;
    }
    buckets
}

/// Bucket index for a value, if any bucket contains it.
///
/// Ranges are contiguous and uniform, so the index is computed instead of
/// scanned. The degenerate single-bucket case takes everything equal to
/// `min`.
pub fn classify(summary: &MetricSummary, value: i64) -> Option<usize> {
    if summary.bucket_width == 0 {
        return (value == summary.min).then_some(0);
    }
    if value < summary.min || value > summary.max {
        return None;
    }
    Some(((value - summary.min) / summary.bucket_width) as usize)
}

/// Second pass: count every record's value into its bucket.
pub fn fill_histogram(
    catalog: &[ListingRecord],
    field: MetricField,
    summary: &MetricSummary,
    buckets: &mut [HistogramBucket],
) {
    for record in catalog {
        if let Some(at) = classify(summary, field.value_of(record)) {
            if let Some(bucket) = buckets.get_mut(at) {
                bucket.count += 1;
            }
        }
    }
}

/// Recompute one field's summary + bucket collection.
async fn rebuild_metric(
    store: &dyn DocumentStore,
    catalog: &[ListingRecord],
    field: MetricField,
) -> Result<MetricSummary, PipelineError> {
    let summary = summarize(catalog, field);
    let mut buckets = build_histogram(&summary);
    fill_histogram(catalog, field, &summary, &mut buckets);

    store
        .upsert(
            collections::HISTOGRAM_META,
            field.key(),
            encode("metric summary", &summary)?,
        )
        .await
        .map_err(at_stage("histogram meta write"))?;

    let mut documents = Vec::with_capacity(buckets.len());
    for bucket in &buckets {
        documents.push((bucket.lower.to_string(), encode("histogram bucket", bucket)?));
    }
    let collection = field.collection();
    store
        .delete_all(collection)
        .await
        .map_err(at_stage("histogram rebuild"))?;
    store
        .upsert_many(collection, documents)
        .await
        .map_err(at_stage("histogram rebuild"))?;

    info!(collection, buckets = buckets.len(), "histogram collection rebuilt");
    Ok(summary)
}

/// Recompute all four histogram projections.
pub async fn rebuild_histograms(
    store: &dyn DocumentStore,
    catalog: &[ListingRecord],
) -> Result<Vec<MetricSummary>, PipelineError> {
    store
        .delete_all(collections::HISTOGRAM_META)
        .await
        .map_err(at_stage("histogram meta rebuild"))?;

    let mut summaries = Vec::with_capacity(MetricField::ALL.len());
    for field in MetricField::ALL {
        summaries.push(rebuild_metric(store, catalog, field).await?);
    }
    Ok(summaries)
}

/// Rebuild every projection from an immutable catalog snapshot.
///
/// The four stages only read the snapshot and write disjoint
/// collections, so they run concurrently. The first failure aborts the
/// run; with delete-then-reinsert persistence that can leave a
/// projection partially rebuilt, which is surfaced to the operator for a
/// manual `rebuild` rather than retried.
pub async fn rebuild_projections(
    store: &dyn DocumentStore,
    catalog: &[ListingRecord],
) -> Result<(), PipelineError> {
    tokio::try_join!(
        rebuild_dimension(store, catalog, GroupDimension::Province),
        rebuild_dimension(store, catalog, GroupDimension::City),
        rebuild_dimension(store, catalog, GroupDimension::Industry),
        rebuild_histograms(store, catalog),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    pub categories_path: PathBuf,
    pub geo_path: PathBuf,
    pub source_id: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("OFC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            fixtures_dir: std::env::var("OFC_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            categories_path: std::env::var("OFC_CATEGORIES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/categories.yaml")),
            geo_path: std::env::var("OFC_GEO")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/geo.yaml")),
            source_id: std::env::var("OFC_SOURCE_ID")
                .unwrap_or_else(|_| "acquizition.biz".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collected: usize,
    pub added: usize,
    pub dirty: bool,
    pub rebuilt: bool,
    pub catalog_size: u64,
}

/// Sequences one catalog run: ingest, then conditionally rebuild.
pub struct CatalogPipeline {
    store: Arc<dyn DocumentStore>,
    source: Box<dyn RawRecordSource>,
}

impl CatalogPipeline {
    pub fn new(store: Arc<dyn DocumentStore>, source: Box<dyn RawRecordSource>) -> Self {
        Self { store, source }
    }

    /// INGEST, then REBUILD when dirty, then DONE. Any stage failure
    /// propagates and aborts the run; nothing is retried.
    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let store = self.store.as_ref();
        info!(%run_id, source_id = self.source.source_id(), "catalog run starting");

        // A source failure lands here, before any mutation.
        let batch = self.source.collect().await?;
        let collected = batch.len();

        let mut catalog = fetch_catalog(store).await?;
        let meta = fetch_meta(store).await?;
        let mut allocator = IdentityAllocator::reconciled(meta, &catalog);

        let outcome = merge_batch(store, &mut allocator, &mut catalog, batch).await?;
        info!(
            %run_id,
            scanned = outcome.scanned,
            added = outcome.added,
            "merge finished"
        );

        let mut rebuilt = false;
        if outcome.dirty {
            allocator.commit(store).await?;
            rebuild_projections(store, &catalog).await?;
            rebuilt = true;
        } else {
            info!(%run_id, "no new records; projection rebuild skipped");
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            collected,
            added: outcome.added,
            dirty: outcome.dirty,
            rebuilt,
            catalog_size: allocator.meta().count,
        })
    }

    /// Operator entry point: recompute every projection from the
    /// persisted catalog without ingesting. The manual rerun for a run
    /// that failed mid-rebuild.
    pub async fn rebuild_catalog(&self) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let store = self.store.as_ref();
        info!(%run_id, "forced projection rebuild starting");

        let catalog = fetch_catalog(store).await?;
        rebuild_projections(store, &catalog).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            collected: 0,
            added: 0,
            dirty: false,
            rebuilt: true,
            catalog_size: catalog.len() as u64,
        })
    }
}
