//! Command-line front end: match events to exposures and fit case-crossover models.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use heatcross::config::AnalysisConfig;
use heatcross::core::{CovariateTable, ExposureIndex, ResultReporter};
use heatcross::io;
use heatcross::pipeline::Analysis;
use heatcross::types::{Event, LocationSet};

#[derive(Parser)]
#[command(name = "heatcross", version, about = "Case-crossover analysis of heat exposure")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match events and fit every configured variant
    Fit(TableArgs),
    /// Match events and write the stratum tables only
    Match(TableArgs),
    /// Extract location exposures from scene rasters
    #[cfg(feature = "gdal")]
    Extract(ExtractArgs),
}

#[derive(Args)]
struct TableArgs {
    /// Exposure table (location_id,date,value,pixel_count)
    #[arg(long)]
    exposures: PathBuf,
    /// Locations (location_id,x,y[,buffer_radius])
    #[arg(long)]
    locations: PathBuf,
    /// Events (timestamp,location_id[,event_id])
    #[arg(long)]
    events: PathBuf,
    /// Long-format covariates (date,location_id,name,value)
    #[arg(long)]
    covariates: Option<PathBuf>,
    /// TOML analysis configuration
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, short, default_value = "heatcross-out")]
    output_dir: PathBuf,
}

#[cfg(feature = "gdal")]
#[derive(Args)]
struct ExtractArgs {
    /// Three-band scene rasters (measurement, quality tier, cloud)
    #[arg(required = true)]
    scenes: Vec<PathBuf>,
    #[arg(long)]
    locations: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Analysis time zone as an offset such as +02:00
    #[arg(long, default_value = "+00:00")]
    utc_offset: String,
    #[arg(long, short, default_value = "exposures.csv")]
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Fit(args) => fit(&args),
        Commands::Match(args) => match_only(&args),
        #[cfg(feature = "gdal")]
        Commands::Extract(args) => extract(&args),
    }
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => AnalysisConfig::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Ok(AnalysisConfig::default()),
    }
}

struct TableInputs {
    analysis: Analysis,
    index: ExposureIndex,
    locations: LocationSet,
    events: Vec<Event>,
    covariates: Option<CovariateTable>,
}

fn load_inputs(args: &TableArgs) -> Result<TableInputs> {
    let analysis = Analysis::new(load_config(args.config.as_deref())?)?;
    let locations = io::read_locations_file(&args.locations)
        .with_context(|| format!("reading locations {}", args.locations.display()))?;
    let events = io::read_events_file(&args.events)
        .with_context(|| format!("reading events {}", args.events.display()))?;
    let index = io::read_exposures_file(&args.exposures)
        .with_context(|| format!("reading exposures {}", args.exposures.display()))?;
    let covariates = args
        .covariates
        .as_ref()
        .map(|path| {
            io::read_covariates_file(path).with_context(|| format!("reading covariates {}", path.display()))
        })
        .transpose()?;

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating output directory {}", args.output_dir.display()))?;

    Ok(TableInputs {
        analysis,
        index,
        locations,
        events,
        covariates,
    })
}

fn strata_path(dir: &Path, variant: &str) -> PathBuf {
    dir.join(format!("strata_{}.csv", variant))
}

fn fit(args: &TableArgs) -> Result<()> {
    let inputs = load_inputs(args)?;
    let output = inputs.analysis.run_with_index(
        inputs.index,
        &inputs.locations,
        &inputs.events,
        inputs.covariates.as_ref(),
    )?;

    for variant in &output.tables {
        io::write_strata_file(strata_path(&args.output_dir, &variant.name), &variant.table)?;
    }
    let report_path = args.output_dir.join("report.json");
    io::write_report_file(&report_path, &output.report)
        .with_context(|| format!("writing report {}", report_path.display()))?;

    print!("{}", ResultReporter::render_text(&output.report));
    log::info!("Report written to {}", report_path.display());
    Ok(())
}

fn match_only(args: &TableArgs) -> Result<()> {
    let inputs = load_inputs(args)?;
    for spec in &inputs.analysis.config().variants {
        let table = inputs
            .analysis
            .match_variant(
                spec,
                &inputs.index,
                &inputs.locations,
                &inputs.events,
                inputs.covariates.as_ref(),
            )
            .with_context(|| format!("matching variant '{}'", spec.name))?;
        let path = strata_path(&args.output_dir, &spec.name);
        io::write_strata_file(&path, &table)?;
        println!("{}: {} strata -> {}", spec.name, table.len(), path.display());
    }
    Ok(())
}

#[cfg(feature = "gdal")]
fn extract(args: &ExtractArgs) -> Result<()> {
    use chrono::FixedOffset;
    use heatcross::io::SceneReader;

    let analysis = Analysis::new(load_config(args.config.as_deref())?)?;
    let offset: FixedOffset = args
        .utc_offset
        .parse()
        .with_context(|| format!("invalid UTC offset '{}'", args.utc_offset))?;
    let locations = io::read_locations_file(&args.locations)
        .with_context(|| format!("reading locations {}", args.locations.display()))?;

    let reader = SceneReader::new(offset);
    let mut scenes = Vec::with_capacity(args.scenes.len());
    for path in &args.scenes {
        match reader.read_scene(path) {
            Ok(scene) => scenes.push(scene),
            Err(e) => log::warn!("Skipping scene {}: {}", path.display(), e),
        }
    }
    if scenes.is_empty() {
        anyhow::bail!("none of the {} scene(s) could be read", args.scenes.len());
    }

    let index = analysis.build_index(scenes, &locations);
    io::write_exposures_file(&args.output, &index)
        .with_context(|| format!("writing exposures {}", args.output.display()))?;

    let summary = index.summary();
    println!(
        "{} of {} scenes usable; {} observations -> {}",
        summary.scenes_usable,
        summary.scenes_total,
        summary.observations,
        args.output.display()
    );
    Ok(())
}
