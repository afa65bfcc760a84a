//! Adapter parsing against the sample exports under `fixtures/`.

use std::path::PathBuf;
use std::time::Duration;

use racefeed_adapters::{
    AdapterContext, HtmlCalendarAdapter, HtmlCalendarConfig, RaceApiAdapter, RaceApiConfig,
    SpreadsheetAdapter, SpreadsheetConfig,
};
use racefeed_core::SourceName;
use serde_json::json;
use uuid::Uuid;

fn fixture(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel)
}

fn ctx() -> AdapterContext {
    AdapterContext::new(Uuid::nil())
}

#[test]
fn race_api_page_fixture() {
    let adapter = RaceApiAdapter::new(RaceApiConfig {
        source_id: "runsignup".into(),
        provenance: "RunSignUp".into(),
        base_url: "http://localhost/rest/races".into(),
        event_types: vec!["running_race".into()],
        zipcode: None,
        radius: None,
        state: Some("CA".into()),
        results_per_page: 25,
        lookahead_days: None,
        timeout: Duration::from_secs(5),
    });
    let body = std::fs::read_to_string(fixture("runsignup/races_page1.json")).unwrap();
    let (records, skipped, items) = adapter.parse_page(&body, &ctx(), "running_race").unwrap();

    assert_eq!(items, 3);
    assert_eq!(skipped, 1);
    let ids: Vec<_> = records.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids, vec!["123", "456"]);
    assert!(records.iter().all(|r| r.source == SourceName::RaceApi));
    assert_eq!(records[0].canonical_id().as_deref(), Some("runsignup_123"));
    assert_eq!(records[0].fields["event_type"], json!("running_race"));
}

#[test]
fn spreadsheet_export_fixture() {
    let path = fixture("ultrasignup/events.csv");
    let adapter = SpreadsheetAdapter::new(SpreadsheetConfig {
        source_id: "ultrasignup".into(),
        provenance: "UltraSignup".into(),
        path: path.clone(),
    });
    let bytes = std::fs::read(path).unwrap();
    let (records, skipped) = adapter.parse_rows(&bytes, &ctx()).unwrap();

    assert_eq!(skipped, 0);
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].external_id, "9001");
    assert_eq!(records[0].fields["Distances"], json!("50M, 50K"));
    assert_eq!(
        records[2].external_id,
        "https://ultrasignup.com/register.aspx?did=9003"
    );
    assert!(records[3].fields.get("Date").is_none());
}

#[test]
fn triathlon_calendar_fixture() {
    let adapter = HtmlCalendarAdapter::new(HtmlCalendarConfig {
        source_id: "tricoach".into(),
        provenance: "TriCoach".into(),
        url: "http://localhost/calendar".into(),
        season_year: 2026,
        default_state: "CA".into(),
        timeout: Duration::from_secs(5),
    });
    let html = std::fs::read_to_string(fixture("tricoach/calendar.html")).unwrap();
    let (records, skipped) = adapter.parse_document(&html, &ctx()).unwrap();

    assert_eq!(skipped, 0);
    let titles: Vec<_> = records
        .iter()
        .map(|r| r.fields["title"].as_str().unwrap())
        .collect();
    assert_eq!(
        titles,
        vec![
            "Uvas Triathlon",
            "Folsom Lake Triathlon",
            "Vineman Full",
            "Lake Tahoe Triathlon"
        ]
    );
    assert_eq!(records[1].fields["distances"], json!(["Sprint", "Olympic"]));
    assert_eq!(records[2].fields["distances"], json!(["Full"]));
    assert_eq!(records[3].fields["state"], json!("CA"));
    assert!(records.iter().all(|r| r.fields["type_hint"] == json!("triathlon")));
}
