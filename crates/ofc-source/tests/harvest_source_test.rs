//! End-to-end harvest collection over the committed workspace fixtures.

use std::path::{Path, PathBuf};

use ofc_source::{CategoryRegistry, GeoTable, HarvestFileSource, RawRecordSource};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn build_source() -> HarvestFileSource {
    let root = workspace_root();
    let registry = CategoryRegistry::from_yaml_path(root.join("config/categories.yaml"))
        .expect("categories registry");
    let geo = GeoTable::from_yaml_path(root.join("config/geo.yaml")).expect("geo table");
    HarvestFileSource::new("acquizition.biz", root.join("fixtures"), registry, geo)
}

#[tokio::test]
async fn collects_all_active_categories_in_registry_order() {
    let drafts = build_source().collect().await.expect("collect");

    // Two bundles with two records each; the zero-page category yields
    // nothing and needs no bundle file on disk.
    assert_eq!(drafts.len(), 4);
    let names: Vec<&str> = drafts.iter().map(|d| d.business_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Harbourview Inn & Bistro",
            "Rue Principale Café",
            "Lakeshore Garden Centre",
            "Prairie Home Furnishings",
        ]
    );
}

#[tokio::test]
async fn normalization_coerces_raw_fields_from_disk() {
    let drafts = build_source().collect().await.expect("collect");

    let inn = &drafts[0];
    assert_eq!(inn.city, "Halifax");
    assert_eq!(inn.province_id, "NS");
    assert_eq!(inn.province_name, "Nova Scotia");
    assert_eq!(inn.price, 1_450_000);
    assert_eq!(inn.profit, 210_000);
    assert_eq!(inn.number_of_employees, 15);
    assert_eq!(
        inn.industry,
        vec!["Accommodations and restaurants".to_string(), "Tourism".to_string()]
    );
    assert_eq!(inn.source, "acquizition.biz");

    let cafe = &drafts[1];
    assert_eq!(cafe.price, 295_000);
    assert!(cafe.images.is_empty());

    let furnishings = &drafts[3];
    // "Entire province" leaves no city; a price-on-request coerces to 0.
    assert_eq!(furnishings.city, "");
    assert_eq!(furnishings.province_name, "Manitoba");
    assert_eq!(furnishings.price, 0);
    assert_eq!(furnishings.founded_year, 0);
    assert_eq!(furnishings.number_of_employees, 8);
}
