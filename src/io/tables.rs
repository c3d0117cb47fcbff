//! CSV readers and writers for the tabular inputs and outputs.
//!
//! Readers are generic over `Read` and writers over `Write`; the `*_file`
//! helpers open paths. Every reader fails on the first malformed row.

use crate::core::covariates::CovariateTable;
use crate::core::exposure_index::ExposureIndex;
use crate::core::report::{AnalysisReport, ResultReporter};
use crate::core::temporal_match::{Role, StratumTable};
use crate::types::{Event, ExposureObservation, HeatError, HeatResult, Location, LocationId, LocationSet};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct LocationRow {
    location_id: String,
    x: f64,
    y: f64,
    #[serde(default)]
    buffer_radius: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EventRow {
    timestamp: String,
    location_id: String,
    #[serde(default)]
    event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CovariateRow {
    date: NaiveDate,
    #[serde(default)]
    location_id: Option<String>,
    name: String,
    value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExposureRow {
    location_id: String,
    date: NaiveDate,
    value: f64,
    pixel_count: i64,
}

/// Rows start at line 2 (after the header)
fn line(row: usize) -> usize {
    row + 2
}

pub fn read_locations<R: Read>(reader: R) -> HeatResult<LocationSet> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut locations = Vec::new();
    for (row, record) in csv.deserialize::<LocationRow>().enumerate() {
        let record = record?;
        if !record.x.is_finite() || !record.y.is_finite() {
            return Err(HeatError::InvalidFormat(format!(
                "line {}: location '{}' has non-finite coordinates",
                line(row),
                record.location_id
            )));
        }
        let mut location = Location::new(record.location_id.trim(), record.x, record.y);
        if let Some(radius) = record.buffer_radius {
            if !radius.is_finite() || radius < 0.0 {
                return Err(HeatError::InvalidFormat(format!(
                    "line {}: invalid buffer radius {}",
                    line(row),
                    radius
                )));
            }
            location = location.with_buffer(radius);
        }
        locations.push(location);
    }
    LocationSet::new(locations)
}

/// Events with RFC 3339 timestamps; a malformed timestamp fails the read
pub fn read_events<R: Read>(reader: R) -> HeatResult<Vec<Event>> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut events = Vec::new();
    for (row, record) in csv.deserialize::<EventRow>().enumerate() {
        let record = record?;
        let timestamp = DateTime::parse_from_rfc3339(record.timestamp.trim()).map_err(|e| {
            HeatError::MalformedTimestamp {
                value: record.timestamp.clone(),
                reason: format!("line {}: {}", line(row), e),
            }
        })?;
        let location = record.location_id.trim();
        if location.is_empty() {
            return Err(HeatError::InvalidFormat(format!("line {}: event without location_id", line(row))));
        }
        let mut event = Event::new(timestamp, location);
        event.id = record.event_id.filter(|id| !id.trim().is_empty());
        events.push(event);
    }
    Ok(events)
}

/// Long-format covariates; an empty location_id marks a date-keyed value
pub fn read_covariates<R: Read>(reader: R) -> HeatResult<CovariateTable> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut table = CovariateTable::new();
    for record in csv.deserialize::<CovariateRow>() {
        let record = record?;
        let name = record.name.trim();
        match record.location_id.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(location) => table.insert_location_date(name, LocationId::new(location), record.date, record.value)?,
            None => table.insert_date(name, record.date, record.value)?,
        }
    }
    Ok(table)
}

/// Re-read a persisted exposure table into a frozen index
pub fn read_exposures<R: Read>(reader: R) -> HeatResult<ExposureIndex> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut observations = Vec::new();
    for (row, record) in csv.deserialize::<ExposureRow>().enumerate() {
        let record = record?;
        let pixel_count = u32::try_from(record.pixel_count).ok().filter(|&n| n > 0).ok_or_else(|| {
            HeatError::InvalidFormat(format!(
                "line {}: pixel_count must be at least 1, got {}",
                line(row),
                record.pixel_count
            ))
        })?;
        let observation = ExposureObservation::new(
            LocationId::new(record.location_id.trim()),
            record.date,
            record.value,
            pixel_count,
        )
        .ok_or_else(|| HeatError::InvalidFormat(format!("line {}: non-finite exposure value", line(row))))?;
        observations.push(observation);
    }
    ExposureIndex::from_observations(observations)
}

pub fn write_exposures<W: Write>(writer: W, index: &ExposureIndex) -> HeatResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for observation in index.observations() {
        csv.serialize(ExposureRow {
            location_id: observation.location().to_string(),
            date: observation.date(),
            value: observation.value(),
            pixel_count: i64::from(observation.pixel_count()),
        })?;
    }
    csv.flush()?;
    Ok(())
}

/// Flat stratum table, one row per case or control, covariates as trailing columns
pub fn write_strata<W: Write>(writer: W, table: &StratumTable) -> HeatResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut header: Vec<String> = [
        "stratum_id",
        "location_id",
        "event_id",
        "role",
        "date",
        "offset_weeks",
        "exposure",
        "pixel_count",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(table.covariate_names().iter().cloned());
    csv.write_record(&header)?;

    for record in table.flat_records() {
        let role = match record.role {
            Role::Case => "case",
            Role::Control => "control",
        };
        let mut fields = vec![
            record.stratum_id.to_string(),
            record.location_id.to_string(),
            record.event_id.clone().unwrap_or_default(),
            role.to_string(),
            record.date.to_string(),
            record.offset_weeks.to_string(),
            record.exposure.to_string(),
            record.pixel_count.to_string(),
        ];
        fields.extend(record.covariates.iter().map(|v| v.to_string()));
        csv.write_record(&fields)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_report<W: Write>(mut writer: W, report: &AnalysisReport) -> HeatResult<()> {
    let json = ResultReporter::to_json(report)?;
    writer.write_all(json.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn open(path: &Path) -> HeatResult<BufReader<File>> {
    log::debug!("Reading {}", path.display());
    Ok(BufReader::new(File::open(path)?))
}

fn create(path: &Path) -> HeatResult<BufWriter<File>> {
    log::debug!("Writing {}", path.display());
    Ok(BufWriter::new(File::create(path)?))
}

pub fn read_locations_file<P: AsRef<Path>>(path: P) -> HeatResult<LocationSet> {
    read_locations(open(path.as_ref())?)
}

pub fn read_events_file<P: AsRef<Path>>(path: P) -> HeatResult<Vec<Event>> {
    read_events(open(path.as_ref())?)
}

pub fn read_covariates_file<P: AsRef<Path>>(path: P) -> HeatResult<CovariateTable> {
    read_covariates(open(path.as_ref())?)
}

pub fn read_exposures_file<P: AsRef<Path>>(path: P) -> HeatResult<ExposureIndex> {
    read_exposures(open(path.as_ref())?)
}

pub fn write_exposures_file<P: AsRef<Path>>(path: P, index: &ExposureIndex) -> HeatResult<()> {
    write_exposures(create(path.as_ref())?, index)
}

pub fn write_strata_file<P: AsRef<Path>>(path: P, table: &StratumTable) -> HeatResult<()> {
    write_strata(create(path.as_ref())?, table)
}

pub fn write_report_file<P: AsRef<Path>>(path: P, report: &AnalysisReport) -> HeatResult<()> {
    let mut writer = create(path.as_ref())?;
    write_report(&mut writer, report)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_locations_with_optional_buffer() {
        let csv = "location_id,x,y,buffer_radius\nA,1.5,2.5,\nB,3.0,4.0,250\n";
        let locations = read_locations(csv.as_bytes()).unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations.get(&"A".into()).unwrap().buffer_radius, None);
        assert_eq!(locations.get(&"B".into()).unwrap().buffer_radius, Some(250.0));

        let no_buffer_column = "location_id,x,y\nA,1.5,2.5\n";
        assert_eq!(read_locations(no_buffer_column.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_location_fails() {
        let csv = "location_id,x,y\nA,1,2\nA,3,4\n";
        assert!(matches!(
            read_locations(csv.as_bytes()),
            Err(HeatError::DuplicateLocation(_))
        ));
    }

    #[test]
    fn test_read_events() {
        let csv = "timestamp,location_id,event_id\n2023-07-15T14:30:00+02:00,A,call-1\n2023-07-16T09:00:00Z,B,\n";
        let events = read_events(csv.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id.as_deref(), Some("call-1"));
        assert_eq!(events[0].timestamp.offset().local_minus_utc(), 7200);
        assert_eq!(events[1].id, None);
    }

    #[test]
    fn test_malformed_timestamp_fails_fast() {
        let csv = "timestamp,location_id\n2023-07-15T14:30:00+02:00,A\n15/07/2023 14:30,B\n";
        match read_events(csv.as_bytes()) {
            Err(HeatError::MalformedTimestamp { value, .. }) => assert_eq!(value, "15/07/2023 14:30"),
            other => panic!("expected malformed timestamp, got {:?}", other),
        }
        // Offset is mandatory
        assert!(read_events("timestamp,location_id\n2023-07-15T14:30:00,A\n".as_bytes()).is_err());
    }

    #[test]
    fn test_read_covariates_long_format() {
        let csv = "date,location_id,name,value\n2023-07-15,,humidity,55\n2023-07-15,A,humidity,70\n";
        let table = read_covariates(csv.as_bytes()).unwrap();
        let d = NaiveDate::from_ymd_opt(2023, 7, 15).unwrap();
        use crate::types::ExposureKey;
        assert_eq!(table.lookup("humidity", &ExposureKey::new("A".into(), d)), Some(70.0));
        assert_eq!(table.lookup("humidity", &ExposureKey::new("B".into(), d)), Some(55.0));
    }

    #[test]
    fn test_exposure_rejects_zero_pixels() {
        let csv = "location_id,date,value,pixel_count\nA,2023-07-15,30.5,0\n";
        assert!(matches!(read_exposures(csv.as_bytes()), Err(HeatError::InvalidFormat(_))));
    }

    #[test]
    fn test_exposure_rejects_duplicate_keys() {
        let csv = "location_id,date,value,pixel_count\nA,2023-07-15,30.5,3\nA,2023-07-15,31.0,2\n";
        assert!(read_exposures(csv.as_bytes()).is_err());
    }
}
