use chrono::{Datelike, FixedOffset, NaiveDate, TimeZone};
use heatcross::core::{
    CaseDateReuse, ExclusionReason, ExposureIndex, MatchWindow, MatchingConfig, Role, StratumTable, TemporalMatcher,
};
use heatcross::io::write_strata;
use heatcross::{Event, ExposureKey, ExposureObservation, Location, LocationId, LocationSet};
use std::collections::HashSet;

const LOCATIONS: usize = 8;

fn day_of_summer(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 6, 1).unwrap() + chrono::Duration::days(i64::from(n))
}

fn locations() -> LocationSet {
    LocationSet::new(
        (0..LOCATIONS)
            .map(|i| Location::new(format!("L{}", i), i as f64 * 100.0, 0.0))
            .collect(),
    )
    .unwrap()
}

/// June to August with deterministic gaps
fn index() -> ExposureIndex {
    let mut observations = Vec::new();
    for loc in 0..LOCATIONS as u32 {
        for n in 0..92u32 {
            if (n * 3 + loc) % 7 == 0 {
                continue;
            }
            let value = 20.0 + f64::from((n * 13 + loc * 5) % 17) * 0.5;
            let pixels = 1 + (n + loc) % 9;
            observations.push(
                ExposureObservation::new(LocationId::new(format!("L{}", loc)), day_of_summer(n), value, pixels)
                    .unwrap(),
            );
        }
    }
    ExposureIndex::from_observations(observations).unwrap()
}

fn events() -> Vec<Event> {
    let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
    let mut events = Vec::new();
    for loc in 0..LOCATIONS as u32 {
        for k in 0..6u32 {
            let n = (loc * 11 + k * 17) % 92;
            let date = day_of_summer(n);
            let timestamp = offset
                .with_ymd_and_hms(date.year(), date.month(), date.day(), 22, 30, 0)
                .unwrap();
            let mut event = Event::new(timestamp, format!("L{}", loc));
            event.id = Some(format!("e{}-{}", loc, k));
            events.push(event);
        }
    }
    events.push(Event::new(
        offset.with_ymd_and_hms(2023, 7, 4, 12, 0, 0).unwrap(),
        "NOWHERE",
    ));
    events
}

fn build(config: &MatchingConfig) -> StratumTable {
    let index = index();
    TemporalMatcher::new(&index, config).build(&events(), &locations()).unwrap()
}

#[test]
fn test_stratum_structure() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = build(&MatchingConfig::default());
    assert!(!table.is_empty());

    for stratum in table.strata() {
        assert_eq!(stratum.case.role, Role::Case);
        assert_eq!(stratum.case.offset_weeks, 0);
        assert!((1..=4).contains(&stratum.controls.len()));
        assert!(stratum.records().all(|r| r.pixel_count >= 1));

        for control in &stratum.controls {
            assert_eq!(control.role, Role::Control);
            assert_eq!(control.date.weekday(), stratum.case.date.weekday());
            assert_eq!(control.date.month(), stratum.case.date.month());
            assert_eq!(control.date.year(), stratum.case.date.year());
            assert_ne!(control.date, stratum.case.date);
            assert_eq!(
                (control.date - stratum.case.date).num_days(),
                i64::from(control.offset_weeks) * 7
            );
        }

        let dates: HashSet<NaiveDate> = stratum.controls.iter().map(|c| c.date).collect();
        assert_eq!(dates.len(), stratum.controls.len());
    }
}

#[test]
fn test_every_event_is_accounted_for() {
    let table = build(&MatchingConfig::default());
    let events = events();
    assert_eq!(table.events_considered(), events.len());
    assert_eq!(table.len() + table.exclusions().total(), events.len());
    assert_eq!(table.exclusions().count(ExclusionReason::UnknownLocation), 1);
}

#[test]
fn test_case_dates_are_not_reused_as_controls() {
    let table = build(&MatchingConfig::default());
    let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
    let case_keys: HashSet<ExposureKey> = events()
        .iter()
        .map(|e| ExposureKey::new(e.location.clone(), e.timestamp.with_timezone(&offset).date_naive()))
        .collect();

    for stratum in table.strata() {
        for control in &stratum.controls {
            assert!(!case_keys.contains(&ExposureKey::new(stratum.location.clone(), control.date)));
        }
    }

    let allowing = build(&MatchingConfig {
        case_date_reuse: CaseDateReuse::Allow,
        ..Default::default()
    });
    assert!(allowing.control_count() >= table.control_count());
}

#[test]
fn test_matching_is_deterministic() {
    let config = MatchingConfig::default();
    let first = build(&config);
    let second = build(&config);
    assert_eq!(first, second);

    let mut a = Vec::new();
    let mut b = Vec::new();
    write_strata(&mut a, &first).unwrap();
    write_strata(&mut b, &second).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_max_controls_caps_nearest_first() {
    let table = build(&MatchingConfig {
        max_controls: 1,
        ..Default::default()
    });
    for stratum in table.strata() {
        assert_eq!(stratum.controls.len(), 1);
    }
}

#[test]
fn test_tolerance_window_crosses_month() {
    let observations = [17, 24, 31]
        .iter()
        .map(|&d| NaiveDate::from_ymd_opt(2023, 7, d).unwrap())
        .chain(std::iter::once(NaiveDate::from_ymd_opt(2023, 8, 7).unwrap()))
        .map(|date| ExposureObservation::new(LocationId::new("L0"), date, 25.0, 4).unwrap());
    let index = ExposureIndex::from_observations(observations).unwrap();
    let event = Event::new(
        FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2023, 7, 31, 23, 0, 0).unwrap(),
        "L0",
    );

    let same_month = MatchingConfig::default();
    let table = TemporalMatcher::new(&index, &same_month)
        .build(std::slice::from_ref(&event), &locations())
        .unwrap();
    let months: Vec<u32> = table.strata()[0].controls.iter().map(|c| c.date.month()).collect();
    assert_eq!(months, vec![7, 7]);

    let tolerant = MatchingConfig {
        window: MatchWindow::ToleranceDays(14),
        ..Default::default()
    };
    let table = TemporalMatcher::new(&index, &tolerant)
        .build(std::slice::from_ref(&event), &locations())
        .unwrap();
    let dates: Vec<NaiveDate> = table.strata()[0].controls.iter().map(|c| c.date).collect();
    assert!(dates.contains(&NaiveDate::from_ymd_opt(2023, 8, 7).unwrap()));
    assert_eq!(dates.len(), 3);
}
