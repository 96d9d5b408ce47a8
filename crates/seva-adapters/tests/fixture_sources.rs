use std::path::{Path, PathBuf};

use seva_adapters::{load_fixture_bundle, FixtureSource, ScrapeSource, SourceKind};
use seva_core::Eligibility;

fn fixture(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(path)
}

#[tokio::test]
async fn central_portal_bundle_yields_records_verbatim() {
    let source = FixtureSource::new(
        "central-portal",
        fixture("fixtures/central-portal/sample/bundle.json"),
    );
    assert_eq!(source.kind(), SourceKind::Fixture);

    let records = source.fetch_latest().await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].name, "PM Kisan Samman Nidhi");
    assert_eq!(records[0].deadline.as_deref(), Some("2026-12-31"));
    assert!(matches!(
        records[0].eligibility_criteria,
        Some(Eligibility::Structured(_))
    ));
    assert_eq!(records[1].deadline, None);
    assert_eq!(records[3].name.trim(), "");
}

#[tokio::test]
async fn state_portal_listing_is_parsed_from_raw_html() {
    let path = fixture("fixtures/state-portal/sample/bundle.json");
    let bundle = load_fixture_bundle(&path).unwrap();
    assert!(bundle.raw_html.is_some());

    let records = FixtureSource::new("state-portal", path)
        .fetch_latest()
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].name, "Ladli Behna Yojana");
    assert_eq!(records[0].category.as_deref(), Some("Women & Child"));
    assert_eq!(
        records[0].source_url,
        "https://welfare.example-state.gov.in/schemes/ladli-behna"
    );
    assert_eq!(records[1].deadline.as_deref(), Some("2026-10-20"));
    assert_eq!(records[2].deadline.as_deref(), Some("to be announced"));
}
