//! Python bindings (feature `python`)

use crate::config::AnalysisConfig;
use crate::core::quality_filter::{FilterOutcome, QualityFilter, QualityFilterConfig, QualityPolicy, QualityStatistics};
use crate::io;
use crate::pipeline::Analysis;
use crate::core::report::ResultReporter;
use crate::types::{GeoTransform, HeatError, Scene};
use chrono::Utc;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn to_py_err(e: HeatError) -> PyErr {
    match e {
        HeatError::Config(_) | HeatError::InvalidFormat(_) | HeatError::MalformedTimestamp { .. } => {
            PyValueError::new_err(e.to_string())
        }
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn statistics_dict<'py>(py: Python<'py>, statistics: &QualityStatistics, usable: bool) -> PyResult<&'py PyDict> {
    let dict = PyDict::new(py);
    dict.set_item("usable", usable)?;
    dict.set_item("total_pixels", statistics.total_pixels)?;
    dict.set_item("cloud_masked", statistics.cloud_masked)?;
    dict.set_item("quality_masked", statistics.quality_masked)?;
    dict.set_item("out_of_range", statistics.out_of_range)?;
    dict.set_item("valid_pixels", statistics.valid_pixels)?;
    dict.set_item("nodata_fraction", statistics.nodata_fraction)?;
    Ok(dict)
}

/// Mask and convert one scene held in numpy arrays.
///
/// Returns the converted surface (NaN where masked) and a statistics dict.
#[pyfunction]
#[pyo3(signature = (measurement, quality, cloud, policy = "strict", scale_factor = 1.0, add_offset = 0.0, unit_offset = 273.15, valid_min = -40.0, valid_max = 60.0))]
#[allow(clippy::too_many_arguments)]
fn apply_quality_filter<'py>(
    py: Python<'py>,
    measurement: PyReadonlyArray2<f32>,
    quality: PyReadonlyArray2<u8>,
    cloud: PyReadonlyArray2<u8>,
    policy: &str,
    scale_factor: f64,
    add_offset: f64,
    unit_offset: f64,
    valid_min: f64,
    valid_max: f64,
) -> PyResult<(&'py PyArray2<f32>, &'py PyDict)> {
    let policy = match policy.to_lowercase().as_str() {
        "strict" => QualityPolicy::Strict,
        "lenient" => QualityPolicy::Lenient,
        _ => return Err(PyValueError::new_err(format!("Invalid quality policy: {}", policy))),
    };
    let filter = QualityFilter::new(QualityFilterConfig {
        policy,
        scale_factor,
        add_offset,
        unit_offset,
        valid_min,
        valid_max,
        ..Default::default()
    });

    let measurement = measurement.as_array().to_owned();
    let dim = measurement.dim();
    let scene = Scene {
        id: "python".to_string(),
        acquired: Utc::now().fixed_offset(),
        geo_transform: GeoTransform::north_up(0.0, 0.0, 1.0),
        measurement,
        quality: quality.as_array().to_owned(),
        cloud: cloud.as_array().to_owned(),
    };

    match filter.apply(scene).map_err(to_py_err)? {
        FilterOutcome::Usable(surface) => {
            let values = ndarray::Array2::from_shape_fn(dim, |(r, c)| surface.value(r, c).unwrap_or(f32::NAN));
            let stats = statistics_dict(py, surface.statistics(), true)?;
            Ok((values.into_pyarray(py), stats))
        }
        FilterOutcome::Unusable(rejection) => {
            let values = ndarray::Array2::from_elem(dim, f32::NAN);
            let stats = statistics_dict(py, &rejection.statistics, false)?;
            Ok((values.into_pyarray(py), stats))
        }
    }
}

/// Run every configured variant over CSV inputs and return the JSON report
#[pyfunction]
#[pyo3(signature = (exposures, locations, events, covariates = None, config_toml = None))]
fn run_analysis(
    exposures: &str,
    locations: &str,
    events: &str,
    covariates: Option<&str>,
    config_toml: Option<&str>,
) -> PyResult<String> {
    let config = match config_toml {
        Some(text) => AnalysisConfig::from_toml_str(text).map_err(to_py_err)?,
        None => AnalysisConfig::default(),
    };
    let analysis = Analysis::new(config).map_err(to_py_err)?;
    let locations = io::read_locations_file(locations).map_err(to_py_err)?;
    let events = io::read_events_file(events).map_err(to_py_err)?;
    let index = io::read_exposures_file(exposures).map_err(to_py_err)?;
    let covariates = covariates
        .map(io::read_covariates_file)
        .transpose()
        .map_err(to_py_err)?;

    let output = analysis
        .run_with_index(index, &locations, &events, covariates.as_ref())
        .map_err(to_py_err)?;
    ResultReporter::to_json(&output.report).map_err(to_py_err)
}

#[pymodule]
fn heatcross(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(apply_quality_filter, m)?)?;
    m.add_function(wrap_pyfunction!(run_analysis, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
