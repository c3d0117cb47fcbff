//! Scene ingestion: acquisition times from granule names, MODIS QC decoding
//! and (feature `gdal`) raster reading.

use crate::types::{CloudBand, HeatError, HeatResult, QualityBand};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

#[cfg(feature = "gdal")]
use crate::types::{GeoTransform, Scene};
#[cfg(feature = "gdal")]
use gdal::Dataset;
#[cfg(feature = "gdal")]
use ndarray::Array2;
#[cfg(feature = "gdal")]
use std::path::Path;

/// Local clock time assumed for day-stamped granules (morning overpass)
const NOMINAL_OVERPASS: (u32, u32) = (10, 30);

/// Quality tier for pixels that were not retrieved at all
pub const REJECTED_TIER: u8 = u8::MAX;

type Pattern = Lazy<Result<Regex, regex::Error>>;

static UTC_STAMP: Pattern = Lazy::new(|| Regex::new(r"(\d{8}T\d{6})"));
static MODIS_DAY: Pattern = Lazy::new(|| Regex::new(r"\.A(\d{4})(\d{3})\."));
static LANDSAT_DATE: Pattern = Lazy::new(|| Regex::new(r"_(\d{8})_\d{8}_\d{2}_T[12]"));

/// Acquisition time of a granule, expressed in the analysis time zone.
///
/// Recognised stamps, tried in order:
/// - `YYYYMMDDTHHMMSS` (ECOSTRESS style), read as UTC
/// - `.AYYYYDDD` (MODIS day of year), at the nominal overpass in local time
/// - `_YYYYMMDD_YYYYMMDD_NN_T1` (Landsat collection), acquisition date at the nominal overpass
pub fn parse_acquisition_time(name: &str, offset: FixedOffset) -> HeatResult<DateTime<FixedOffset>> {
    let malformed = |reason: String| HeatError::MalformedTimestamp {
        value: name.to_string(),
        reason,
    };
    let compiled = |pattern: &'static Pattern| Lazy::force(pattern).as_ref().map_err(|e| malformed(e.to_string()));

    if let Some(captures) = compiled(&UTC_STAMP)?.captures(name) {
        let naive = NaiveDateTime::parse_from_str(&captures[1], "%Y%m%dT%H%M%S")
            .map_err(|e| malformed(format!("bad UTC stamp {}: {}", &captures[1], e)))?;
        return Ok(Utc.from_utc_datetime(&naive).with_timezone(&offset));
    }

    let date = if let Some(captures) = compiled(&MODIS_DAY)?.captures(name) {
        let year: i32 = captures[1].parse().map_err(|_| malformed("bad year".to_string()))?;
        let day: u32 = captures[2].parse().map_err(|_| malformed("bad day of year".to_string()))?;
        NaiveDate::from_yo_opt(year, day).ok_or_else(|| malformed(format!("day {} outside {}", day, year)))?
    } else if let Some(captures) = compiled(&LANDSAT_DATE)?.captures(name) {
        NaiveDate::parse_from_str(&captures[1], "%Y%m%d")
            .map_err(|e| malformed(format!("bad acquisition date {}: {}", &captures[1], e)))?
    } else {
        return Err(malformed("no recognised acquisition stamp".to_string()));
    };

    let (hour, minute) = NOMINAL_OVERPASS;
    let local = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| malformed("invalid nominal overpass time".to_string()))?;
    offset
        .from_local_datetime(&local)
        .single()
        .ok_or_else(|| malformed("ambiguous local time".to_string()))
}

/// Map a MODIS LST QC byte to a quality tier (0 best).
///
/// Bits 0-1 are the mandatory QA flag and bits 6-7 the LST error class.
pub fn decode_modis_qc(qc: u8) -> u8 {
    match qc & 0b11 {
        0b00 => 0,
        0b01 => match (qc >> 6) & 0b11 {
            0b00 => 1,
            0b01 => 2,
            _ => 3,
        },
        _ => REJECTED_TIER,
    }
}

/// True when the QC byte says the pixel was not produced because of cloud
pub fn modis_cloud_flag(qc: u8) -> bool {
    qc & 0b11 == 0b10
}

/// Split a MODIS QC band into the quality-tier and cloud bands the filter expects
pub fn split_modis_qc(qc: &QualityBand) -> (QualityBand, CloudBand) {
    let quality = qc.mapv(decode_modis_qc);
    let cloud = qc.mapv(|q| u8::from(modis_cloud_flag(q)));
    (quality, cloud)
}

/// Reads co-registered three-band rasters (measurement, quality tier, cloud)
#[cfg(feature = "gdal")]
pub struct SceneReader {
    offset: FixedOffset,
}

#[cfg(feature = "gdal")]
impl SceneReader {
    /// Acquisition times are expressed in `offset`
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn read_scene<P: AsRef<Path>>(&self, path: P) -> HeatResult<Scene> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| HeatError::InvalidFormat(format!("not a file path: {}", path.display())))?;
        let id = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        let acquired = parse_acquisition_time(&file_name, self.offset)?;

        log::debug!("Reading scene {} acquired {}", id, acquired);
        let dataset = Dataset::open(path)?;
        if dataset.raster_count() < 3 {
            return Err(HeatError::InvalidFormat(format!(
                "scene {}: expected 3 bands (measurement, quality, cloud), found {}",
                id,
                dataset.raster_count()
            )));
        }
        let (width, height) = dataset.raster_size();
        if width == 0 || height == 0 {
            return Err(HeatError::EmptyInput(format!("scene {} has no pixels", id)));
        }
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);

        Ok(Scene {
            measurement: read_band::<f32>(&dataset, 1, width, height)?,
            quality: read_band::<u8>(&dataset, 2, width, height)?,
            cloud: read_band::<u8>(&dataset, 3, width, height)?,
            id,
            acquired,
            geo_transform,
        })
    }
}

#[cfg(feature = "gdal")]
fn read_band<T>(dataset: &Dataset, index: isize, width: usize, height: usize) -> HeatResult<Array2<T>>
where
    T: gdal::raster::GdalType + Copy,
{
    let band = dataset.rasterband(index)?;
    let buffer = band.read_as::<T>((0, 0), (width, height), (width, height), None)?;
    Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| HeatError::Processing(format!("Failed to reshape band {}: {}", index, e)))
}
