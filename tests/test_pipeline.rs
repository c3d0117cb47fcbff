use chrono::{FixedOffset, NaiveDate, TimeZone};
use heatcross::core::{CovariateTable, ExposureIndex, MissingCovariatePolicy, VariantOutcome};
use heatcross::io;
use heatcross::{
    Analysis, AnalysisConfig, Event, ExposureObservation, GeoTransform, Location, LocationId, LocationSet, Scene,
    VariantSpec,
};
use ndarray::Array2;
use std::fs;
use tempfile::TempDir;

const LOCATIONS: u32 = 60;

fn july(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 7, day).unwrap()
}

fn location_id(i: u32) -> LocationId {
    LocationId::new(format!("L{:02}", i))
}

fn locations() -> LocationSet {
    LocationSet::new(
        (0..LOCATIONS)
            .map(|i| Location::new(location_id(i).as_str(), f64::from(i) * 50.0, 0.0))
            .collect(),
    )
    .unwrap()
}

/// Each location has one event between 8 and 21 July
fn case_day(i: u32) -> u32 {
    8 + i % 14
}

/// Every July day at every location; the case day runs 3 degrees hot
fn exposure_index() -> ExposureIndex {
    let mut observations = Vec::new();
    for i in 0..LOCATIONS {
        for day in 1..=31 {
            let mut value = 20.0 + f64::from((i * 7 + day * 13) % 11);
            if day == case_day(i) {
                value += 3.0;
            }
            observations.push(ExposureObservation::new(location_id(i), july(day), value, 5).unwrap());
        }
    }
    ExposureIndex::from_observations(observations).unwrap()
}

fn events() -> Vec<Event> {
    let offset = FixedOffset::east_opt(2 * 3600).unwrap();
    (0..LOCATIONS)
        .map(|i| {
            let mut event = Event::new(
                offset.with_ymd_and_hms(2023, 7, case_day(i), 23, 10, 0).unwrap(),
                location_id(i).as_str(),
            );
            event.id = Some(format!("ev{}", i));
            event
        })
        .collect()
}

fn humidity() -> CovariateTable {
    let mut table = CovariateTable::new();
    for day in 1..=31 {
        table.insert_date("humidity", july(day), f64::from(day % 5) * 10.0).unwrap();
    }
    table
}

fn config() -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    config.variants = vec![
        VariantSpec::primary(),
        VariantSpec::new("humidity").with_covariates(&["humidity"]),
        VariantSpec::new("august").with_months(&[8]),
    ];
    config
}

#[test]
fn test_variants_fit_independently() {
    let _ = env_logger::builder().is_test(true).try_init();
    let analysis = Analysis::new(config()).unwrap();
    let covariates = humidity();
    let output = analysis
        .run_with_index(exposure_index(), &locations(), &events(), Some(&covariates))
        .unwrap();

    let report = &output.report;
    assert_eq!(report.variants.len(), 3);

    let primary = report.variant("primary").unwrap();
    assert_eq!(primary.strata, 60);
    assert!(primary.controls >= 120);
    match &primary.outcome {
        VariantOutcome::Fitted {
            uncertainty_available,
            estimates,
            ..
        } => {
            assert!(uncertainty_available);
            let exposure = &estimates[0];
            assert_eq!(exposure.term, "exposure");
            assert!(exposure.coefficient > 0.0);
            assert!((exposure.odds_ratio - exposure.coefficient.exp()).abs() < 1e-12);
            let (lo, hi) = (exposure.ci_lower.unwrap(), exposure.ci_upper.unwrap());
            assert!(lo < exposure.odds_ratio && exposure.odds_ratio < hi);
        }
        other => panic!("primary not fitted: {:?}", other),
    }

    let adjusted = report.variant("humidity").unwrap();
    assert!(adjusted.is_fitted());
    assert!(adjusted.estimate("humidity").is_some());

    // No August events: the seasonal variant fails on its own
    let august = report.variant("august").unwrap();
    assert!(matches!(august.outcome, VariantOutcome::Failed { .. }));
    assert_eq!(august.exclusions.iter().map(|(_, n)| n).sum::<usize>(), 60);

    assert_eq!(output.table("humidity").unwrap().covariate_names(), ["humidity".to_string()]);
}

#[test]
fn test_missing_covariate_policies() {
    // Humidity only for the first half of the month
    let mut partial = CovariateTable::new();
    for day in 1..=15 {
        partial.insert_date("humidity", july(day), f64::from(day)).unwrap();
    }

    let mut config = config();
    config.variants = vec![VariantSpec::new("humidity").with_covariates(&["humidity"])];
    config.regression.min_strata = 1;
    let output = Analysis::new(config.clone())
        .unwrap()
        .run_with_index(exposure_index(), &locations(), &events(), Some(&partial))
        .unwrap();
    let table = output.table("humidity").unwrap();
    assert!(table.len() < 60);
    for stratum in table.strata() {
        assert!(stratum.records().all(|r| r.date <= july(15)));
    }

    config.covariates.missing = MissingCovariatePolicy::DropVariant;
    let output = Analysis::new(config)
        .unwrap()
        .run_with_index(exposure_index(), &locations(), &events(), Some(&partial))
        .unwrap();
    match &output.report.variants[0].outcome {
        VariantOutcome::Failed { cause } => assert!(cause.contains("humidity"), "cause was {}", cause),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn test_csv_round_trip_through_files() {
    let dir = TempDir::new().unwrap();
    let index = exposure_index();

    let exposures = dir.path().join("exposures.csv");
    io::write_exposures_file(&exposures, &index).unwrap();
    let reread = io::read_exposures_file(&exposures).unwrap();
    assert_eq!(reread.len(), index.len());
    let original = index.get(&location_id(3), july(11)).unwrap();
    let copy = reread.get(&location_id(3), july(11)).unwrap();
    assert_eq!(original, copy);

    let events_path = dir.path().join("events.csv");
    let mut csv = String::from("timestamp,location_id,event_id\n");
    for event in events() {
        csv.push_str(&format!(
            "{},{},{}\n",
            event.timestamp.to_rfc3339(),
            event.location,
            event.id.unwrap_or_default()
        ));
    }
    fs::write(&events_path, csv).unwrap();
    assert_eq!(io::read_events_file(&events_path).unwrap(), events());

    let analysis = Analysis::new(AnalysisConfig::default()).unwrap();
    let output = analysis
        .run_with_index(reread, &locations(), &events(), None)
        .unwrap();

    let strata_path = dir.path().join("strata_primary.csv");
    io::write_strata_file(&strata_path, output.table("primary").unwrap()).unwrap();
    let strata = fs::read_to_string(&strata_path).unwrap();
    let mut lines = strata.lines();
    assert_eq!(
        lines.next().unwrap(),
        "stratum_id,location_id,event_id,role,date,offset_weeks,exposure,pixel_count"
    );
    assert_eq!(lines.filter(|l| l.contains(",case,")).count(), 60);

    let report_path = dir.path().join("report.json");
    io::write_report_file(&report_path, &output.report).unwrap();
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["variants"][0]["name"], "primary");
    assert_eq!(json["variants"][0]["outcome"]["state"], "fitted");
    assert_eq!(json["index"]["observations"], 60 * 31);
}

#[test]
fn test_run_from_scenes_with_toml_config() {
    let config = AnalysisConfig::from_toml_str(
        r#"
        [extraction]
        mode = "point"

        [regression]
        min_strata = 1
        "#,
    )
    .unwrap();
    let analysis = Analysis::new(config).unwrap();
    let offset = FixedOffset::east_opt(0).unwrap();

    let scene = |day: u32, celsius: f32| Scene {
        id: format!("S{}", day),
        acquired: offset.with_ymd_and_hms(2023, 7, day, 1, 0, 0).unwrap(),
        geo_transform: GeoTransform::north_up(0.0, 20.0, 10.0),
        measurement: Array2::from_shape_fn((2, 2), |(r, c)| celsius + 273.15 + (r + c) as f32),
        quality: Array2::zeros((2, 2)),
        cloud: Array2::zeros((2, 2)),
    };
    let locations = LocationSet::new(vec![Location::new("A", 5.0, 15.0), Location::new("B", 15.0, 5.0)]).unwrap();
    let events = vec![
        Event::new(offset.with_ymd_and_hms(2023, 7, 12, 20, 0, 0).unwrap(), "A"),
        Event::new(offset.with_ymd_and_hms(2023, 7, 19, 20, 0, 0).unwrap(), "B"),
    ];

    let output = analysis
        .run(
            vec![scene(5, 25.0), scene(12, 27.0), scene(19, 26.0), scene(26, 24.0)],
            &locations,
            &events,
            None,
        )
        .unwrap();

    assert_eq!(output.report.index.scenes_usable, 4);
    assert_eq!(output.index.len(), 8);
    // Point sampling picks the containing pixel: A is (0, 0), B is (1, 1)
    let a = output.index.get(&"A".into(), july(12)).unwrap();
    let b = output.index.get(&"B".into(), july(12)).unwrap();
    assert!((a.value() - 27.0).abs() < 1e-3);
    assert!((b.value() - 29.0).abs() < 1e-3);
    assert_eq!(output.table("primary").unwrap().len(), 2);
}
