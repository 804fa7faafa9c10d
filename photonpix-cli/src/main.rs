//! photonpix CLI: calibrate, cluster and project Timepix3 photon event lists.
#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use photonpix_core::hit::{seconds_from_ticks, PixelCoord};
use photonpix_core::{
    ClusteringSettings, HostClusteringSettings, HostProjectionSettings, Operation,
    ProjectionSettings,
};
use photonpix_io::{
    run_clustering, run_projection, ClusterFileFormat, ClusterFileWriter, EventAccessor,
    EventInput, EventListFile, ImageFileFormat, ImageFileWriter,
};
use photonpix_tpx::{CalibrationTable, DetectorConfig, DetectorGeometry};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, photonpix_io::Error>;

/// Calibration, clustering and projection of Timepix3 photon events.
#[derive(Parser)]
#[command(name = "photonpix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log progress and per-stage summaries (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster an event list and write the clusters
    Cluster {
        /// Input event-list file
        input: PathBuf,

        /// Output file (.csv for text, anything else for binary)
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        detector: DetectorArgs,

        #[command(flatten)]
        clustering: ClusteringArgs,
    },

    /// Cluster an event list and project the clusters into an image
    Project {
        /// Input event-list file
        input: PathBuf,

        /// Output image (.csv for text, anything else for raw f32 plus JSON sidecar)
        #[arg(short, long)]
        output: PathBuf,

        /// Flat-field event list; enables white-image normalisation
        #[arg(long)]
        white: Option<PathBuf>,

        #[command(flatten)]
        detector: DetectorArgs,

        #[command(flatten)]
        clustering: ClusteringArgs,

        #[command(flatten)]
        projection: ProjectionArgs,
    },

    /// Show information about an event list
    Info {
        /// Input event-list file
        input: PathBuf,
    },

    /// Evaluate the calibration for one pixel
    Energy {
        /// Calibration XML file (default calibration if omitted)
        #[arg(short, long)]
        calibration: Option<PathBuf>,

        /// Pixel column
        x: u16,

        /// Pixel row
        y: u16,

        /// Time over threshold
        tot: u16,
    },
}

#[derive(Args)]
struct DetectorArgs {
    /// Detector metadata JSON (geometry and calibration file)
    #[arg(long)]
    detector: Option<PathBuf>,

    /// Calibration XML file, overrides the one named in the metadata
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Precompute the energy lookup table up to this ToT (0 disables it)
    #[arg(long, default_value = "1024")]
    max_tot: usize,

    /// Events requested per read
    #[arg(long, default_value_t = photonpix_io::DEFAULT_BLOCK_SIZE)]
    block_size: usize,
}

#[derive(Args)]
struct ClusteringArgs {
    /// Clustering settings JSON (host units); replaces the flags below
    #[arg(long)]
    clustering_settings: Option<PathBuf>,

    /// Temporal margin for clustering (nanoseconds)
    #[arg(long, default_value = "100.0")]
    temporal_margin_ns: f64,

    /// Merge fluorescence-escape cluster pairs
    #[arg(long)]
    xrf: bool,

    /// Lower energy bound for XRF candidates (keV)
    #[arg(long, default_value = "0.0")]
    xrf_min_energy: f64,

    /// Upper energy bound for XRF candidates (keV)
    #[arg(long, default_value = "100.0")]
    xrf_max_energy: f64,

    /// Temporal margin for XRF partners (nanoseconds)
    #[arg(long, default_value = "100.0")]
    xrf_temporal_margin_ns: f64,

    /// Centroid distance limit for XRF partners (pixels)
    #[arg(long, default_value = "10.0")]
    xrf_distance_limit: f64,

    /// Emit every event as its own cluster
    #[arg(long)]
    passthrough: bool,
}

#[derive(Args)]
struct ProjectionArgs {
    /// Value accumulated per cluster
    #[arg(long, default_value = "energy")]
    attribute: String,

    /// How values sharing a pixel are combined
    #[arg(long, default_value = "sum")]
    mode: String,

    /// Lower energy bound (keV)
    #[arg(long, default_value = "0.0")]
    min_energy: f64,

    /// Upper energy bound (keV)
    #[arg(long)]
    max_energy: Option<f64>,

    /// Start of the time window (seconds)
    #[arg(long, default_value = "0.0")]
    min_time: f64,

    /// End of the time window (seconds)
    #[arg(long)]
    max_time: Option<f64>,

    /// Image width (pixels)
    #[arg(long, default_value = "256")]
    width: u64,

    /// Image height (pixels)
    #[arg(long, default_value = "256")]
    height: u64,
}

/// Output encoding chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Text,
    Binary,
}

impl OutputKind {
    fn from_path(path: &Path) -> Self {
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            Self::Text
        } else {
            Self::Binary
        }
    }
}

/// Operation context that logs progress in 10% steps.
struct LogOperation {
    stage: &'static str,
    last_decile: AtomicU64,
}

impl LogOperation {
    fn new(stage: &'static str) -> Self {
        Self {
            stage,
            last_decile: AtomicU64::new(0),
        }
    }
}

impl Operation for LogOperation {
    fn set_progress(&self, fraction: f64) {
        let decile = (fraction.clamp(0.0, 1.0) * 10.0).floor() as u64;
        if self.last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
            log::info!("{}: {}%", self.stage, decile * 10);
        }
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

impl DetectorArgs {
    /// Loads the detector geometry and calibration, building the lookup table.
    fn load(&self) -> Result<(DetectorGeometry, CalibrationTable)> {
        let config = match &self.detector {
            Some(path) => {
                log::info!("Loading detector metadata from {}", path.display());
                DetectorConfig::from_file(path)?
            }
            None => DetectorConfig::default(),
        };
        let mut calibration = match &self.calibration {
            Some(path) => CalibrationTable::from_xml_file(path)?,
            None => config.load_calibration()?,
        };
        calibration.precompute_lookup_table(self.max_tot);
        Ok((config.geometry, calibration))
    }

    fn input(
        &self,
        path: &Path,
        geometry: &DetectorGeometry,
        calibration: &Arc<CalibrationTable>,
    ) -> Result<EventInput<EventListFile>> {
        let mut file = EventListFile::open(path)?;
        if self.detector.is_some() {
            file = file.with_bounding_box(geometry.bounding_box());
        }
        Ok(EventInput::new(file, Arc::clone(calibration))
            .with_geometry(geometry.clone())
            .with_block_size(self.block_size))
    }
}

impl ClusteringArgs {
    fn settings(&self) -> Result<ClusteringSettings> {
        let host = match &self.clustering_settings {
            Some(path) => {
                let reader = BufReader::new(File::open(path)?);
                serde_json::from_reader(reader)?
            }
            None => HostClusteringSettings {
                temporal_margin: self.temporal_margin_ns,
                xrf_correction: self.xrf,
                xrf_min_energy: self.xrf_min_energy,
                xrf_max_energy: self.xrf_max_energy,
                xrf_temporal_margin: self.xrf_temporal_margin_ns,
                xrf_distance_limit: self.xrf_distance_limit,
                passthrough: self.passthrough,
            },
        };
        Ok(ClusteringSettings::try_from(host)?)
    }
}

impl ProjectionArgs {
    fn settings(&self, white_image: bool) -> Result<ProjectionSettings> {
        let defaults = HostProjectionSettings::default();
        let host = HostProjectionSettings {
            attribute: self.attribute.clone(),
            mode: self.mode.clone(),
            min_energy: self.min_energy,
            max_energy: self.max_energy.unwrap_or(defaults.max_energy),
            min_time: self.min_time,
            max_time: self.max_time.unwrap_or(defaults.max_time),
            image_width: self.width,
            image_height: self.height,
            enable_white_image: white_image,
        };
        Ok(ProjectionSettings::try_from(host)?)
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Cluster {
            input,
            output,
            detector,
            clustering,
        } => {
            let settings = clustering.settings()?;
            let (geometry, calibration) = detector.load()?;
            let input = detector.input(&input, &geometry, &Arc::new(calibration))?;

            let format = match OutputKind::from_path(&output) {
                OutputKind::Text => ClusterFileFormat::Csv,
                OutputKind::Binary => ClusterFileFormat::Binary,
            };
            let start = Instant::now();
            let mut sink = ClusterFileWriter::create(&output, format)?;
            let version = run_clustering(&input, &settings, &mut sink, &LogOperation::new("cluster"))?;

            println!(
                "Wrote {} clusters in {:.2}s",
                sink.count(),
                start.elapsed().as_secs_f64()
            );
            println!("Output: {} (version {:016x})", version.object, version.version);
        }

        Commands::Project {
            input,
            output,
            white,
            detector,
            clustering,
            projection,
        } => {
            let clustering = clustering.settings()?;
            let projection = projection.settings(white.is_some())?;
            let (geometry, calibration) = detector.load()?;
            let calibration = Arc::new(calibration);
            let input = detector.input(&input, &geometry, &calibration)?;
            let white = white
                .map(|path| detector.input(&path, &geometry, &calibration))
                .transpose()?;

            let format = match OutputKind::from_path(&output) {
                OutputKind::Text => ImageFileFormat::Csv,
                OutputKind::Binary => ImageFileFormat::RawF32,
            };
            let start = Instant::now();
            let mut sink = ImageFileWriter::new(&output, format);
            let version = run_projection(
                &input,
                white.as_ref(),
                &clustering,
                &projection,
                &mut sink,
                &LogOperation::new("project"),
            )?;

            println!(
                "Wrote {}x{} image in {:.2}s",
                projection.image_width,
                projection.image_height,
                start.elapsed().as_secs_f64()
            );
            println!("Output: {} (version {:016x})", version.object, version.version);
        }

        Commands::Info { input } => {
            let file = EventListFile::open(&input)?;
            let info = file.stream_info(0)?;

            println!("File: {}", input.display());
            println!("Events: {}", info.event_count);
            if !file.is_empty() {
                let duration = info.max_timestamp - info.min_timestamp;
                println!("Time range: {} - {} ticks", info.min_timestamp, info.max_timestamp);
                println!("Duration: {:.6} s", seconds_from_ticks(duration));

                let (min_x, max_x, min_y, max_y, max_tot) = file.iter().fold(
                    (u16::MAX, 0, u16::MAX, 0, 0),
                    |(min_x, max_x, min_y, max_y, max_tot), e| {
                        (
                            min_x.min(e.coord.x),
                            max_x.max(e.coord.x),
                            min_y.min(e.coord.y),
                            max_y.max(e.coord.y),
                            max_tot.max(e.tot),
                        )
                    },
                );
                println!("X range: {min_x} - {max_x}");
                println!("Y range: {min_y} - {max_y}");
                println!("Max ToT: {max_tot}");
            }
        }

        Commands::Energy {
            calibration,
            x,
            y,
            tot,
        } => {
            let table = match calibration {
                Some(path) => CalibrationTable::from_xml_file(path)?,
                None => CalibrationTable::default(),
            };
            let pixel = PixelCoord::checked(x, y)?;
            let (a, b, c, t) = table.coefficients(pixel);
            let estimate = table.estimate(pixel, tot);

            println!("Pixel ({x}, {y}): a={a} b={b} c={c} t={t}");
            if estimate.degenerate {
                println!("Energy: {} (degenerate calibration)", estimate.value);
            } else {
                println!("Energy: {} keV", estimate.value);
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", err.id());
            ExitCode::FAILURE
        }
    }
}
