//! Harvest-source contracts, raw-field coercion and geo reference data.
//!
//! The browser-automation side of harvesting lives outside this workspace;
//! what arrives here are bundle files of raw extracted fields, one bundle
//! per scraped category. Everything raw is text and everything text is
//! coerced, never rejected: unparseable numbers become 0, unresolvable
//! lookups become empty strings.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ofc_core::ListingDraft;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ofc-source";

/// Currency every harvested listing is quoted in.
pub const CURRENCY: &str = "CAD";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing bundle {path}: {source}")]
    MalformedBundle {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("parsing {path}: {source}")]
    MalformedConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no harvest bundle for category {category} at {path}")]
    MissingBundle { category: String, path: PathBuf },
}

/// Producer of one finite, ordered batch of listing drafts per invocation.
///
/// The whole batch is gathered before the merge stage begins; there is no
/// incremental delivery.
#[async_trait]
pub trait RawRecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn collect(&self) -> Result<Vec<ListingDraft>, SourceError>;
}

/// One harvested page-walk worth of raw listings for a single category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestBundle {
    pub source_id: String,
    pub source_url: String,
    pub category: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<RawListing>,
}

/// Raw extracted fields, exactly as pulled out of the listing page.
///
/// Numeric-looking fields stay strings here; coercion happens in
/// [`normalize_raw_listing`]. All fields default so a sparse record
/// deserializes to empties instead of failing the bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawListing {
    pub business_name: String,
    pub region: String,
    pub country: String,
    pub founded_year: String,
    pub images: Vec<String>,
    pub business_sector: String,
    pub description: String,
    pub number_of_employees: String,
    pub selling_price: String,
    pub profit: String,
    pub annual_revenue: String,
    pub seller_name: String,
    pub seller_email: String,
    pub seller_phone: String,
    pub listing_url: String,
    pub source_listing_id: String,
}

/// Coerce a money string (`"$1 500 000 (negotiable)"`) to a whole amount.
///
/// Whitespace, `$` and thousands separators are stripped, the string is
/// truncated at the first letter or parenthesis, and whatever remains is
/// parsed. Anything unparseable coerces to 0.
pub fn coerce_money(text: &str) -> i64 {
    let stripped: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '$' && *c != ',')
        .collect();
    let cut = stripped
        .find(|c: char| c.is_alphabetic() || c == '(' || c == ')')
        .unwrap_or(stripped.len());
    stripped[..cut].parse().unwrap_or(0)
}

/// Coerce an employee-count string to a total headcount.
///
/// The source renders counts as `" - "`-separated segments like
/// `"5 full-time - 3 part-time"`; each segment contributes the number
/// before its first space. Segments without a space carry no unit label
/// and are ignored, matching the harvester's rendering.
pub fn coerce_employee_count(text: &str) -> u32 {
    let mut total: u32 = 0;
    for token in text.split(" - ") {
        let token = token.trim();
        let Some(space) = token.find(' ') else {
            continue;
        };
        if let Ok(count) = token[..space].trim().parse::<u32>() {
            total = total.saturating_add(count);
        }
    }
    total
}

/// Coerce a year string; empty or junk becomes 0.
pub fn coerce_year(text: &str) -> u32 {
    text.trim().parse().unwrap_or(0)
}

/// City/province split of a raw region string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegionParts {
    pub city: String,
    pub province_id: String,
    pub province_name: String,
}

/// Split a raw region string (`"Ontario - Toronto Area"`) into city and
/// province, resolving the province half against the reference table.
///
/// Only the first line counts; an `" Area"` suffix on the city is
/// dropped, `"entire province"` means no city, and an unknown province
/// resolves to empty strings rather than an error.
pub fn split_region(region: &str, geo: &GeoTable) -> RegionParts {
    let region = region.trim();
    if region.is_empty() {
        return RegionParts::default();
    }
    let line = region.lines().next().unwrap_or_default();

    let (province_text, mut city) = match line.find('-') {
        None => (line.trim().to_string(), String::new()),
        Some(dash) => {
            let mut city = line[dash + 1..].trim().to_string();
            if let Some(area) = city.find(" Area") {
                city = city[..area].trim().to_string();
            }
            (line[..dash].trim().to_string(), city)
        }
    };

    let (province_id, province_name) = match geo.find_province(&province_text) {
        Some((id, name)) => (id.to_string(), name.to_string()),
        None => (String::new(), String::new()),
    };

    if city.to_ascii_lowercase().contains("entire province") {
        city.clear();
    }

    RegionParts {
        city: capitalize_first(&city),
        province_id,
        province_name,
    }
}

/// Split a raw business-sector block into a per-record deduplicated
/// industry list.
///
/// Each line looks like `"Tourism - 19600"`; the part before `" - "` is
/// the industry name, `/` becomes `" & "`, blank results are dropped and
/// repeats within the record collapse to one entry.
pub fn parse_business_sectors(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut industries = Vec::new();
    for line in text.lines() {
        let name = match line.find(" - ") {
            Some(sep) => &line[..sep],
            None => "",
        };
        let name = name.trim().replace('/', " & ");
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.clone()) {
            industries.push(name);
        }
    }
    industries
}

/// Short-form description: the long form truncated at 200 characters
/// with an ellipsis.
pub fn short_description_of(long: &str) -> String {
    if long.chars().count() > 200 {
        let truncated: String = long.chars().take(200).collect();
        format!("{truncated}...")
    } else {
        long.to_string()
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

/// Normalize one raw listing into a draft, applying every coercion rule.
pub fn normalize_raw_listing(
    raw: &RawListing,
    bundle: &HarvestBundle,
    geo: &GeoTable,
) -> ListingDraft {
    let region = split_region(&raw.region, geo);
    let long_description = raw.description.trim().to_string();
    ListingDraft {
        business_name: raw.business_name.trim().to_string(),
        city: region.city,
        province_id: region.province_id,
        province_name: region.province_name,
        country: raw.country.trim().to_string(),
        currency: CURRENCY.to_string(),
        founded_year: coerce_year(&raw.founded_year),
        images: raw.images.clone(),
        industry: parse_business_sectors(&raw.business_sector),
        short_description: short_description_of(&long_description),
        long_description,
        number_of_employees: coerce_employee_count(&raw.number_of_employees),
        price: coerce_money(&raw.selling_price),
        profit: coerce_money(&raw.profit),
        revenue: coerce_money(&raw.annual_revenue),
        seller_name: raw.seller_name.trim().to_string(),
        seller_email: raw.seller_email.trim().to_string(),
        seller_phone: raw.seller_phone.trim().to_string(),
        source: bundle.source_id.clone(),
        source_url: bundle.source_url.clone(),
        listing_url: raw.listing_url.clone(),
        source_listing_id: raw.source_listing_id.trim().to_string(),
        date_scraped: bundle.captured_at,
    }
}

/// Normalize every record of a bundle, in bundle order.
pub fn bundle_to_drafts(bundle: &HarvestBundle, geo: &GeoTable) -> Vec<ListingDraft> {
    bundle
        .records
        .iter()
        .map(|raw| normalize_raw_listing(raw, bundle, geo))
        .collect()
}

pub fn load_harvest_bundle(path: impl AsRef<Path>) -> Result<HarvestBundle, SourceError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|err| SourceError::Io {
        path: path.to_path_buf(),
        source: err,
    })?;
    serde_json::from_str(&text).map_err(|err| SourceError::MalformedBundle {
        path: path.to_path_buf(),
        source: err,
    })
}

/// One city row of the geo reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityRow {
    pub city: String,
    #[serde(default)]
    pub city_ascii: String,
    pub province_id: String,
    pub province_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GeoFile {
    cities: Vec<CityRow>,
}

/// Immutable province/city reference data, built once at startup and
/// passed by reference into normalization.
#[derive(Debug, Clone, Default)]
pub struct GeoTable {
    cities: Vec<CityRow>,
    provinces: Vec<(String, String)>,
}

impl GeoTable {
    /// Build the table from city rows, deriving the deduplicated
    /// province list in first-seen order.
    pub fn from_rows(cities: Vec<CityRow>) -> Self {
        let mut provinces: Vec<(String, String)> = Vec::new();
        for row in &cities {
            let known = provinces
                .iter()
                .any(|(id, name)| *id == row.province_id && *name == row.province_name);
            if !known {
                provinces.push((row.province_id.clone(), row.province_name.clone()));
            }
        }
        Self { cities, provinces }
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| SourceError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
        let file: GeoFile =
            serde_yaml::from_str(&text).map_err(|err| SourceError::MalformedConfig {
                path: path.to_path_buf(),
                source: err,
            })?;
        Ok(Self::from_rows(file.cities))
    }

    /// Resolve free text against province codes and names,
    /// case-insensitively. Returns `(province_id, province_name)`.
    pub fn find_province(&self, text: &str) -> Option<(&str, &str)> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.provinces
            .iter()
            .find(|(id, name)| id.to_lowercase() == needle || name.to_lowercase() == needle)
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }

    pub fn cities(&self) -> &[CityRow] {
        &self.cities
    }

    pub fn provinces(&self) -> &[(String, String)] {
        &self.provinces
    }
}

/// One category the external scraper walks; `page_count` 0 means the
/// category is currently empty and produces no bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub url: String,
    pub page_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRegistry {
    pub categories: Vec<CategoryConfig>,
}

impl CategoryRegistry {
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| SourceError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
        serde_yaml::from_str(&text).map_err(|err| SourceError::MalformedConfig {
            path: path.to_path_buf(),
            source: err,
        })
    }
}

/// Directory-safe slug for a category name, used to locate its bundle.
pub fn category_slug(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Bundle-file-backed source: one `<slug>/batch.json` per active
/// category under the fixtures root, normalized against the geo table.
pub struct HarvestFileSource {
    source_id: String,
    fixtures_root: PathBuf,
    registry: CategoryRegistry,
    geo: GeoTable,
}

impl HarvestFileSource {
    pub fn new(
        source_id: impl Into<String>,
        fixtures_root: impl Into<PathBuf>,
        registry: CategoryRegistry,
        geo: GeoTable,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            fixtures_root: fixtures_root.into(),
            registry,
            geo,
        }
    }

    fn bundle_path(&self, category: &CategoryConfig) -> PathBuf {
        self.fixtures_root
            .join(category_slug(&category.name))
            .join("batch.json")
    }
}

#[async_trait]
impl RawRecordSource for HarvestFileSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn collect(&self) -> Result<Vec<ListingDraft>, SourceError> {
        let mut drafts = Vec::new();
        for category in &self.registry.categories {
            if category.page_count == 0 {
                continue;
            }
            let path = self.bundle_path(category);
            if !path.exists() {
                return Err(SourceError::MissingBundle {
                    category: category.name.clone(),
                    path,
                });
            }
            let bundle = load_harvest_bundle(&path)?;
            drafts.extend(bundle_to_drafts(&bundle, &self.geo));
        }
        Ok(drafts)
    }
}

/// Fixed in-memory batch, for tests and replay runs.
pub struct StaticSource {
    source_id: String,
    drafts: Vec<ListingDraft>,
}

impl StaticSource {
    pub fn new(source_id: impl Into<String>, drafts: Vec<ListingDraft>) -> Self {
        Self {
            source_id: source_id.into(),
            drafts,
        }
    }
}

#[async_trait]
impl RawRecordSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn collect(&self) -> Result<Vec<ListingDraft>, SourceError> {
        Ok(self.drafts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn geo() -> GeoTable {
        GeoTable::from_rows(vec![
            CityRow {
                city: "Toronto".to_string(),
                city_ascii: "Toronto".to_string(),
                province_id: "ON".to_string(),
                province_name: "Ontario".to_string(),
            },
            CityRow {
                city: "Ottawa".to_string(),
                city_ascii: "Ottawa".to_string(),
                province_id: "ON".to_string(),
                province_name: "Ontario".to_string(),
            },
            CityRow {
                city: "Montreal".to_string(),
                city_ascii: "Montreal".to_string(),
                province_id: "QC".to_string(),
                province_name: "Quebec".to_string(),
            },
        ])
    }

    #[test]
    fn money_strings_coerce_to_whole_amounts() {
        assert_eq!(coerce_money("$450 000"), 450_000);
        assert_eq!(coerce_money("$1,500,000"), 1_500_000);
        assert_eq!(coerce_money("$500 (negotiable)"), 500);
        assert_eq!(coerce_money("750000"), 750_000);
    }

    #[test]
    fn unparseable_money_coerces_to_zero() {
        assert_eq!(coerce_money(""), 0);
        assert_eq!(coerce_money("Please contact"), 0);
        assert_eq!(coerce_money("N/A"), 0);
        assert_eq!(coerce_money("$"), 0);
    }

    #[test]
    fn employee_segments_sum_their_leading_numbers() {
        assert_eq!(coerce_employee_count("5 full-time - 3 part-time"), 8);
        assert_eq!(coerce_employee_count("12 employees"), 12);
        assert_eq!(coerce_employee_count("ten employees - 2 seasonal"), 2);
    }

    #[test]
    fn unlabeled_employee_counts_are_ignored() {
        assert_eq!(coerce_employee_count("10"), 0);
        assert_eq!(coerce_employee_count(""), 0);
    }

    #[test]
    fn region_resolves_province_and_city() {
        let parts = split_region("Ontario - Toronto Area", &geo());
        assert_eq!(
            parts,
            RegionParts {
                city: "Toronto".to_string(),
                province_id: "ON".to_string(),
                province_name: "Ontario".to_string(),
            }
        );
    }

    #[test]
    fn region_matches_province_codes_case_insensitively() {
        let parts = split_region("qc - montreal", &geo());
        assert_eq!(parts.province_id, "QC");
        assert_eq!(parts.province_name, "Quebec");
        assert_eq!(parts.city, "Montreal");
    }

    #[test]
    fn region_without_dash_is_province_only() {
        let parts = split_region("Ontario", &geo());
        assert_eq!(parts.city, "");
        assert_eq!(parts.province_id, "ON");
    }

    #[test]
    fn entire_province_region_clears_the_city() {
        let parts = split_region("Quebec - Entire province", &geo());
        assert_eq!(parts.city, "");
        assert_eq!(parts.province_name, "Quebec");
    }

    #[test]
    fn unknown_region_coerces_to_empty_strings() {
        let parts = split_region("Atlantis - Lost City", &geo());
        assert_eq!(parts.province_id, "");
        assert_eq!(parts.province_name, "");
        assert_eq!(parts.city, "Lost City");
    }

    #[test]
    fn business_sectors_split_rename_and_dedupe() {
        let sectors = parse_business_sectors(
            "Manufacturing/Transformation - 14500\nTourism - 19600\nTourism - 19600\nno separator line",
        );
        assert_eq!(
            sectors,
            vec![
                "Manufacturing & Transformation".to_string(),
                "Tourism".to_string(),
            ]
        );
    }

    #[test]
    fn long_descriptions_truncate_into_short_form() {
        let long = "x".repeat(250);
        let short = short_description_of(&long);
        assert_eq!(short.chars().count(), 203);
        assert!(short.ends_with("..."));

        assert_eq!(short_description_of("compact"), "compact");
    }

    #[test]
    fn category_slugs_are_directory_safe() {
        assert_eq!(category_slug("Accommodations and restaurants"), "accommodations-and-restaurants");
        assert_eq!(category_slug("Manufacturing/Transformation"), "manufacturing-transformation");
        assert_eq!(category_slug("  Renting  "), "renting");
    }

    #[test]
    fn geo_table_dedupes_provinces_in_first_seen_order() {
        let table = geo();
        assert_eq!(
            table.provinces(),
            &[
                ("ON".to_string(), "Ontario".to_string()),
                ("QC".to_string(), "Quebec".to_string()),
            ]
        );
    }

    #[test]
    fn normalization_applies_every_coercion() {
        let bundle = HarvestBundle {
            source_id: "acquizition.biz".to_string(),
            source_url: "https://www.acquizition.biz/".to_string(),
            category: "Tourism".to_string(),
            captured_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().expect("ts"),
            records: vec![RawListing {
                business_name: "  Harbourview Marina  ".to_string(),
                region: "Ontario - Toronto Area".to_string(),
                country: "Canada".to_string(),
                founded_year: "1998".to_string(),
                images: vec!["https://img.example/1.jpg".to_string()],
                business_sector: "Tourism - 19600\nShows and recreation - 19500".to_string(),
                description: "d".repeat(300),
                number_of_employees: "4 full-time - 2 part-time".to_string(),
                selling_price: "$750 000".to_string(),
                profit: "$120 000 (before tax)".to_string(),
                annual_revenue: "not disclosed".to_string(),
                ..RawListing::default()
            }],
        };

        let drafts = bundle_to_drafts(&bundle, &geo());
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.business_name, "Harbourview Marina");
        assert_eq!(draft.city, "Toronto");
        assert_eq!(draft.province_id, "ON");
        assert_eq!(draft.founded_year, 1998);
        assert_eq!(draft.number_of_employees, 6);
        assert_eq!(draft.price, 750_000);
        assert_eq!(draft.profit, 120_000);
        assert_eq!(draft.revenue, 0);
        assert_eq!(draft.currency, CURRENCY);
        assert_eq!(draft.industry.len(), 2);
        assert_eq!(draft.short_description.chars().count(), 203);
        assert_eq!(draft.source, "acquizition.biz");
        assert_eq!(draft.date_scraped, bundle.captured_at);
    }

    #[tokio::test]
    async fn static_source_hands_back_its_batch() {
        let source = StaticSource::new(
            "fixture",
            vec![ListingDraft {
                business_name: "Corner Store".to_string(),
                ..ListingDraft::default()
            }],
        );
        let drafts = source.collect().await.expect("collect");
        assert_eq!(drafts.len(), 1);
        assert_eq!(source.source_id(), "fixture");
    }
}
