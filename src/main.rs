//! Command-line front end for the microscope controller.
//!
//! Runs against simulated hardware unless a stage port is configured, in which case
//! the OpenFlexure motor board is driven over serial (build with
//! `--features instrument_serial`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use microscope_daq::adapters::SerialAdapter;
use microscope_daq::config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use microscope_daq::experiment::{AcquisitionResult, AutofocusRequest, ScanPlan};
use microscope_daq::hardware::mock::SimulatedSensor;
use microscope_daq::hardware::openflexure::OpenFlexureStage;
use microscope_daq::hardware::Stage;
use microscope_daq::microscope::simulated_hardware;
use microscope_daq::settings::MicroscopeSettings;
use microscope_daq::{logging, Microscope, MicroscopeError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

type Scope = Microscope<Box<dyn Stage>, SimulatedSensor>;

#[derive(Debug, Parser)]
#[command(name = "microscope_daq", version, about = "Closed-loop microscope controller")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Seed for the simulated sensor noise
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Serial port of the OpenFlexure motor board; simulated stage if omitted
    #[arg(long, global = true)]
    stage_port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Autofocus on Z and report the best position
    Focus {
        /// Sweep range in steps
        #[arg(long)]
        range: Option<u32>,
        /// Sweep step in steps
        #[arg(long)]
        step: Option<u32>,
    },
    /// Calibrate exposure, flat field and white balance
    Calibrate {
        /// Relative spread at which the flat field counts as uniform
        #[arg(long)]
        tolerance: Option<f64>,
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Give each colour channel its own gain table plane
        #[arg(long)]
        per_channel: bool,
        /// Where to save the resulting settings (YAML)
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Run a scan and write its summary as JSON
    Scan {
        #[command(subcommand)]
        plan: ScanCommand,
        /// Summary file; defaults to `<output_dir>/<uid>.json`
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print a saved settings file
    ShowSettings { path: PathBuf },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Debug, Subcommand)]
enum ScanCommand {
    /// Lateral raster starting at the current position
    Raster {
        #[arg(long)]
        points: Option<usize>,
        #[arg(long, allow_hyphen_values = true)]
        dx: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        dy: Option<i64>,
    },
    /// Z-stack starting at the current position
    ZStack {
        #[arg(long)]
        points: Option<usize>,
        #[arg(long, allow_hyphen_values = true)]
        step: Option<i64>,
    },
    /// Autofocused Z-stacks at the centre and, with a shift, on either side of it
    Edge {
        #[arg(long, allow_hyphen_values = true)]
        shift_x: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        shift_y: Option<i64>,
        /// Autofocus range before each stack
        #[arg(long)]
        range: Option<u32>,
        #[arg(long)]
        step: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ControllerConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(seed) = cli.seed {
        config.simulation.seed = seed;
    }
    if let Some(port) = &cli.stage_port {
        config.stage.port = Some(port.clone());
    }

    logging::init(&config.application.log_level, config.application.json_logs);
    info!(config = %cli.config.display(), "Starting {}", config.application.name);

    match cli.command {
        Command::ShowSettings { path } => show_settings(&path),
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Focus { range, step } => {
            let mut scope = build_microscope(&config)?;
            let report = scope.autofocus(range, step).context("autofocus failed")?;
            println!(
                "best focus at {} (score {:.4}, {} samples, {} refinement passes)",
                report.best,
                report.best_score,
                report.samples.len(),
                report.passes
            );
            Ok(())
        }
        Command::Calibrate {
            tolerance,
            max_iterations,
            per_channel,
            settings,
        } => {
            config.calibration.per_channel |= per_channel;
            let mut scope = build_microscope(&config)?;
            let tolerance = tolerance.unwrap_or(config.calibration.uniformity_tolerance);
            let max_iterations = max_iterations.unwrap_or(config.calibration.max_iterations);
            let report = match scope.calibrate(tolerance, max_iterations) {
                Ok(report) => report,
                Err(MicroscopeError::CalibrationDidNotConverge {
                    best_spread,
                    improving,
                    ..
                }) if improving => {
                    anyhow::bail!(
                        "calibration still improving after {max_iterations} iterations \
                         (spread {best_spread:.4}); try --max-iterations {}",
                        max_iterations * 2
                    )
                }
                Err(e) => return Err(e).context("calibration failed"),
            };
            for it in &report.history {
                println!(
                    "iteration {:>2}: target {:.1}, min {:.1}, max {:.1}, spread {:.4}",
                    it.iteration, it.target, it.min_mean, it.max_mean, it.spread
                );
            }
            let path = settings.unwrap_or_else(|| config.application.output_dir.join("settings.yaml"));
            scope
                .settings()
                .save(&path)
                .with_context(|| format!("saving settings to {}", path.display()))?;
            println!(
                "exposure {} us, red gain {:.3}, blue gain {:.3}; settings saved to {}",
                report.exposure_us,
                report.channel_gains.red,
                report.channel_gains.blue,
                path.display()
            );
            Ok(())
        }
        Command::Scan { plan, output } => {
            let mut scope = build_microscope(&config)?;
            let plan = build_plan(&scope, &plan);
            let (result, failure) = match scope.run_plan(&plan) {
                Ok(result) => (result, None),
                Err(MicroscopeError::PlanAborted {
                    step,
                    partial,
                    source,
                }) => (*partial, Some(format!("scan aborted at step {step}: {source}"))),
                Err(e) => return Err(e).context("scan failed"),
            };
            let path = output.unwrap_or_else(|| {
                config
                    .application
                    .output_dir
                    .join(format!("{}.json", result.uid))
            });
            write_summary(&result, &path)?;
            println!("{} entries written to {}", result.len(), path.display());
            match failure {
                Some(message) => anyhow::bail!(message),
                None => Ok(()),
            }
        }
    }
}

/// Stage from the configuration, simulated sensor, saved settings applied.
fn build_microscope(config: &ControllerConfig) -> Result<Scope> {
    let (simulated_stage, sensor) = simulated_hardware(&config.simulation);
    let stage: Box<dyn Stage> = match &config.stage.port {
        Some(port) => {
            let mut adapter = SerialAdapter::new(port.as_str(), config.stage.baud_rate)
                .with_timeout(Duration::from_millis(config.stage.timeout_ms));
            adapter
                .connect()
                .with_context(|| format!("opening stage port {port}"))?;
            let board = OpenFlexureStage::connect(adapter)
                .context("waiting for the motor board banner")?
                .with_backlash(config.stage.backlash);
            warn!("No camera driver available; frames come from the simulated sensor");
            Box::new(board)
        }
        None => Box::new(simulated_stage),
    };

    let mut scope = Microscope::from_config(stage, sensor, config);
    if let Some(path) = &config.capture.settings_file {
        let saved = MicroscopeSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?;
        scope.apply_settings(&saved);
    }
    Ok(scope)
}

fn build_plan(scope: &Scope, command: &ScanCommand) -> ScanPlan {
    let scan = scope.scan_config();
    match *command {
        ScanCommand::Raster { points, dx, dy } => ScanPlan::raster(
            points.unwrap_or(scan.raster_points),
            dx.unwrap_or(scan.raster_step[0]),
            dy.unwrap_or(scan.raster_step[1]),
        ),
        ScanCommand::ZStack { points, step } => ScanPlan::z_stack(
            points.unwrap_or(scan.z_stack_points),
            step.unwrap_or(scan.z_stack_step),
        ),
        ScanCommand::Edge {
            shift_x,
            shift_y,
            range,
            step,
        } => {
            let mut scan = scan.clone();
            if shift_x.is_some() || shift_y.is_some() {
                scan.edge_shift = Some([shift_x.unwrap_or(0), shift_y.unwrap_or(0)]);
            }
            let focus = AutofocusRequest {
                search_range: range,
                step_size: step,
                ..AutofocusRequest::default()
            };
            scan.edge_scan_plan(focus)
        }
    }
}

fn write_summary(result: &AcquisitionResult, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&result.summary())?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn show_settings(path: &Path) -> Result<()> {
    let settings = MicroscopeSettings::load(path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    println!("exposure:      {} us", settings.exposure_us);
    println!("analog gain:   {:.3}", settings.analog_gain);
    println!(
        "white balance: red {:.3}, blue {:.3}",
        settings.channel_gains.red, settings.channel_gains.blue
    );
    match &settings.gain_table {
        Some(table) => {
            let factors = table.channel_factors();
            let min = factors.iter().copied().fold(f64::INFINITY, f64::min);
            let max = factors.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            println!(
                "gain table:    {}x{} regions, {} plane(s), factors {min:.3}..{max:.3}",
                table.rows(),
                table.cols(),
                table.planes()
            );
        }
        None => println!("gain table:    none"),
    }
    Ok(())
}
