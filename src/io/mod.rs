//! Readers and writers at the collaborator boundary

pub mod scene_reader;
pub mod tables;

#[cfg(feature = "gdal")]
pub use scene_reader::SceneReader;
pub use scene_reader::{decode_modis_qc, parse_acquisition_time, split_modis_qc};
pub use tables::{
    read_covariates, read_covariates_file, read_events, read_events_file, read_exposures, read_exposures_file,
    read_locations, read_locations_file, write_exposures, write_exposures_file, write_report, write_report_file,
    write_strata, write_strata_file,
};
