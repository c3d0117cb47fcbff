//! Time-stratified case-crossover matching.
//!
//! Each event becomes a stratum: the exposure on the event date (case) plus
//! the exposures on referent dates a whole number of weeks away (controls),
//! all at the event's location. Weekly offsets keep the day of week fixed and
//! the window policy keeps referents inside the case's month.

use crate::core::covariates::{CovariateTable, MissingCovariatePolicy};
use crate::core::exclusions::{ExclusionLog, ExclusionReason};
use crate::core::exposure_index::ExposureIndex;
use crate::types::{CalendarConfig, Event, ExposureKey, HeatError, HeatResult, LocationId, LocationSet};
use chrono::{Datelike, Duration, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Upper bound on controls per stratum, whatever the configuration asks for
pub const MAX_CONTROLS: usize = 4;

/// Admissible distance between a case date and its referents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchWindow {
    /// Same calendar month and year
    SameMonth,
    /// At most this many days away
    ToleranceDays(u32),
}

/// Whether a date holding a case may serve as a control for another case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseDateReuse {
    Forbid,
    Allow,
}

/// Matching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Referent offsets in whole weeks
    pub offsets_weeks: Vec<i32>,
    pub window: MatchWindow,
    pub case_date_reuse: CaseDateReuse,
    /// At most [`MAX_CONTROLS`]
    pub max_controls: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            offsets_weeks: vec![-2, -1, 1, 2],
            window: MatchWindow::SameMonth,
            case_date_reuse: CaseDateReuse::Forbid,
            max_controls: MAX_CONTROLS,
        }
    }
}

impl MatchingConfig {
    /// Offsets in candidate order: ascending magnitude, earlier before later
    pub fn ordered_offsets(&self) -> Vec<i32> {
        let mut offsets: Vec<i32> = self.offsets_weeks.iter().copied().filter(|&o| o != 0).collect();
        offsets.sort_by_key(|&o| (o.unsigned_abs(), o));
        offsets.dedup();
        offsets
    }

    /// Configured cap, clamped to [`MAX_CONTROLS`]
    pub fn control_limit(&self) -> usize {
        self.max_controls.min(MAX_CONTROLS)
    }

    pub fn admits_window(&self, case: NaiveDate, candidate: NaiveDate) -> bool {
        match self.window {
            MatchWindow::SameMonth => case.year() == candidate.year() && case.month() == candidate.month(),
            MatchWindow::ToleranceDays(days) => (candidate - case).num_days().abs() <= i64::from(days),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Case,
    Control,
}

/// One case or control row, copied verbatim from the index and covariate sources
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumRecord {
    pub role: Role,
    pub date: NaiveDate,
    pub offset_weeks: i32,
    pub exposure: f64,
    pub pixel_count: u32,
    pub covariates: Vec<f64>,
}

/// One case with its one to `max_controls` controls at a single location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedStratum {
    pub id: usize,
    pub location: LocationId,
    pub event_id: Option<String>,
    pub case: StratumRecord,
    pub controls: Vec<StratumRecord>,
}

impl MatchedStratum {
    /// Case first, then controls in candidate order
    pub fn records(&self) -> impl Iterator<Item = &StratumRecord> {
        std::iter::once(&self.case).chain(self.controls.iter())
    }

    pub fn size(&self) -> usize {
        1 + self.controls.len()
    }

    /// Rows = records (case in row 0), columns = exposure then covariates
    pub fn design_matrix(&self) -> Array2<f64> {
        let cols = 1 + self.case.covariates.len();
        let mut design = Array2::zeros((self.size(), cols));
        for (row, record) in self.records().enumerate() {
            design[[row, 0]] = record.exposure;
            for (j, &value) in record.covariates.iter().enumerate() {
                design[[row, j + 1]] = value;
            }
        }
        design
    }
}

/// Flat, tabular view of one stratum record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatStratumRecord {
    pub stratum_id: usize,
    pub location_id: LocationId,
    pub event_id: Option<String>,
    pub role: Role,
    pub date: NaiveDate,
    pub offset_weeks: i32,
    pub exposure: f64,
    pub pixel_count: u32,
    pub covariates: Vec<f64>,
}

/// Immutable snapshot of one matching run
#[derive(Debug, Clone, PartialEq)]
pub struct StratumTable {
    covariate_names: Vec<String>,
    strata: Vec<MatchedStratum>,
    exclusions: ExclusionLog,
    events_considered: usize,
}

impl StratumTable {
    pub fn strata(&self) -> &[MatchedStratum] {
        &self.strata
    }

    pub fn len(&self) -> usize {
        self.strata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Model terms: exposure followed by the covariates
    pub fn term_names(&self) -> Vec<String> {
        std::iter::once("exposure".to_string())
            .chain(self.covariate_names.iter().cloned())
            .collect()
    }

    pub fn exclusions(&self) -> &ExclusionLog {
        &self.exclusions
    }

    pub fn events_considered(&self) -> usize {
        self.events_considered
    }

    pub fn record_count(&self) -> usize {
        self.strata.iter().map(MatchedStratum::size).sum()
    }

    pub fn control_count(&self) -> usize {
        self.strata.iter().map(|s| s.controls.len()).sum()
    }

    pub fn flat_records(&self) -> Vec<FlatStratumRecord> {
        self.strata
            .iter()
            .flat_map(|stratum| {
                stratum.records().map(move |record| FlatStratumRecord {
                    stratum_id: stratum.id,
                    location_id: stratum.location.clone(),
                    event_id: stratum.event_id.clone(),
                    role: record.role,
                    date: record.date,
                    offset_weeks: record.offset_weeks,
                    exposure: record.exposure,
                    pixel_count: record.pixel_count,
                    covariates: record.covariates.clone(),
                })
            })
            .collect()
    }
}

/// Append-only accumulator for one matching run
#[derive(Debug, Default)]
pub struct StratumTableBuilder {
    covariate_names: Vec<String>,
    strata: Vec<MatchedStratum>,
    exclusions: ExclusionLog,
    events_considered: usize,
}

impl StratumTableBuilder {
    pub fn new(covariate_names: Vec<String>) -> Self {
        Self {
            covariate_names,
            ..Default::default()
        }
    }

    /// Append a stratum; an empty control set is recorded as an exclusion instead.
    /// Returns the assigned stratum id.
    pub fn push_stratum(
        &mut self,
        location: LocationId,
        event_id: Option<String>,
        case: StratumRecord,
        controls: Vec<StratumRecord>,
    ) -> Option<usize> {
        self.events_considered += 1;
        if controls.is_empty() {
            self.exclusions.record(ExclusionReason::NoAdmissibleControls);
            return None;
        }
        let id = self.strata.len() + 1;
        self.strata.push(MatchedStratum {
            id,
            location,
            event_id,
            case,
            controls,
        });
        Some(id)
    }

    pub fn exclude(&mut self, reason: ExclusionReason) {
        self.events_considered += 1;
        self.exclusions.record(reason);
    }

    pub fn record_dropped_controls(&mut self, count: usize) {
        self.exclusions.record_many(ExclusionReason::ControlMissingCovariate, count);
    }

    pub fn finish(self) -> StratumTable {
        StratumTable {
            covariate_names: self.covariate_names,
            strata: self.strata,
            exclusions: self.exclusions,
            events_considered: self.events_considered,
        }
    }
}

#[derive(Debug)]
enum EventOutcome {
    Matched {
        location: LocationId,
        event_id: Option<String>,
        case: StratumRecord,
        controls: Vec<StratumRecord>,
        dropped_controls: usize,
    },
    Excluded {
        reason: ExclusionReason,
        dropped_controls: usize,
    },
}

impl EventOutcome {
    fn excluded(reason: ExclusionReason) -> Self {
        EventOutcome::Excluded {
            reason,
            dropped_controls: 0,
        }
    }
}

/// Builds matched strata from an event log and a frozen exposure index
pub struct TemporalMatcher<'a> {
    index: &'a ExposureIndex,
    config: &'a MatchingConfig,
    calendar: CalendarConfig,
    covariates: Option<&'a CovariateTable>,
    covariate_names: Vec<String>,
    missing_policy: MissingCovariatePolicy,
    months: Option<Vec<u32>>,
}

impl<'a> TemporalMatcher<'a> {
    pub fn new(index: &'a ExposureIndex, config: &'a MatchingConfig) -> Self {
        Self {
            index,
            config,
            calendar: CalendarConfig::default(),
            covariates: None,
            covariate_names: Vec::new(),
            missing_policy: MissingCovariatePolicy::DropMember,
            months: None,
        }
    }

    pub fn with_calendar(mut self, calendar: CalendarConfig) -> Self {
        self.calendar = calendar;
        self
    }

    /// Attach covariates by name. Every name must exist in the table.
    pub fn with_covariates(
        mut self,
        table: Option<&'a CovariateTable>,
        names: Vec<String>,
        policy: MissingCovariatePolicy,
    ) -> HeatResult<Self> {
        if !names.is_empty() {
            let table = table.ok_or_else(|| {
                HeatError::Config(format!("covariates {:?} requested but no covariate table supplied", names))
            })?;
            if let Some(unknown) = names.iter().find(|n| !table.contains(n.as_str())) {
                return Err(HeatError::Config(format!("unknown covariate '{}'", unknown)));
            }
        }
        self.covariates = table;
        self.covariate_names = names;
        self.missing_policy = policy;
        Ok(self)
    }

    /// Restrict cases to these months of the year (1-12)
    pub fn with_months(mut self, months: Option<Vec<u32>>) -> Self {
        self.months = months;
        self
    }

    /// Match every event. Events are processed independently and merged in input order.
    pub fn build(&self, events: &[Event], locations: &LocationSet) -> HeatResult<StratumTable> {
        // Case dates come from the full event log, before any season filter
        let case_dates: HashSet<ExposureKey> = events
            .iter()
            .filter(|e| locations.contains(&e.location))
            .map(|e| ExposureKey::new(e.location.clone(), self.calendar.date_of(&e.timestamp)))
            .collect();

        #[cfg(feature = "parallel")]
        let outcomes: Vec<HeatResult<EventOutcome>> = {
            use rayon::prelude::*;
            events
                .par_iter()
                .map(|event| self.match_event(event, locations, &case_dates))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<HeatResult<EventOutcome>> = events
            .iter()
            .map(|event| self.match_event(event, locations, &case_dates))
            .collect();

        let mut builder = StratumTableBuilder::new(self.covariate_names.clone());
        for outcome in outcomes {
            match outcome? {
                EventOutcome::Matched {
                    location,
                    event_id,
                    case,
                    controls,
                    dropped_controls,
                } => {
                    builder.record_dropped_controls(dropped_controls);
                    builder.push_stratum(location, event_id, case, controls);
                }
                EventOutcome::Excluded {
                    reason,
                    dropped_controls,
                } => {
                    builder.record_dropped_controls(dropped_controls);
                    builder.exclude(reason);
                }
            }
        }

        let table = builder.finish();
        log::info!(
            "Matched {} of {} events into strata ({} controls); excluded: {}",
            table.len(),
            table.events_considered(),
            table.control_count(),
            table.exclusions().total()
        );
        Ok(table)
    }

    fn match_event(
        &self,
        event: &Event,
        locations: &LocationSet,
        case_dates: &HashSet<ExposureKey>,
    ) -> HeatResult<EventOutcome> {
        if !locations.contains(&event.location) {
            return Ok(EventOutcome::excluded(ExclusionReason::UnknownLocation));
        }

        let date = self.calendar.date_of(&event.timestamp);
        if let Some(months) = &self.months {
            if !months.contains(&date.month()) {
                return Ok(EventOutcome::excluded(ExclusionReason::OutsideSeason));
            }
        }

        let case_key = ExposureKey::new(event.location.clone(), date);
        let Some(case_obs) = self.index.get_key(&case_key) else {
            return Ok(EventOutcome::excluded(ExclusionReason::UnexposedOnDate));
        };
        let Some(case_covariates) = self.covariates_for(&case_key)? else {
            return Ok(EventOutcome::excluded(ExclusionReason::MissingCovariate));
        };

        let case = StratumRecord {
            role: Role::Case,
            date,
            offset_weeks: 0,
            exposure: case_obs.value(),
            pixel_count: case_obs.pixel_count(),
            covariates: case_covariates,
        };

        let mut controls = Vec::new();
        let mut seen: Vec<NaiveDate> = Vec::new();
        let mut dropped_controls = 0;

        for offset in self.config.ordered_offsets() {
            if controls.len() >= self.config.control_limit() {
                break;
            }
            let Some(candidate) = date.checked_add_signed(Duration::weeks(i64::from(offset))) else {
                continue;
            };
            if seen.contains(&candidate) {
                continue;
            }
            seen.push(candidate);

            if !self.config.admits_window(date, candidate) {
                continue;
            }
            let key = ExposureKey::new(event.location.clone(), candidate);
            if self.config.case_date_reuse == CaseDateReuse::Forbid && case_dates.contains(&key) {
                continue;
            }
            let Some(obs) = self.index.get_key(&key) else {
                continue;
            };
            let Some(covariates) = self.covariates_for(&key)? else {
                dropped_controls += 1;
                continue;
            };

            controls.push(StratumRecord {
                role: Role::Control,
                date: candidate,
                offset_weeks: offset,
                exposure: obs.value(),
                pixel_count: obs.pixel_count(),
                covariates,
            });
        }

        if controls.is_empty() {
            return Ok(EventOutcome::Excluded {
                reason: ExclusionReason::NoAdmissibleControls,
                dropped_controls,
            });
        }

        Ok(EventOutcome::Matched {
            location: event.location.clone(),
            event_id: event.id.clone(),
            case,
            controls,
            dropped_controls,
        })
    }

    /// Covariate values for a key; None drops the member, an error drops the variant
    fn covariates_for(&self, key: &ExposureKey) -> HeatResult<Option<Vec<f64>>> {
        if self.covariate_names.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let Some(table) = self.covariates else {
            return Ok(None);
        };
        match table.lookup_all(&self.covariate_names, key) {
            Ok(values) => Ok(Some(values)),
            Err(missing) => match self.missing_policy {
                MissingCovariatePolicy::DropMember => Ok(None),
                MissingCovariatePolicy::DropVariant => Err(HeatError::MissingCovariate {
                    name: missing.to_string(),
                    location: key.location.clone(),
                    date: key.date,
                }),
            },
        }
    }
}
