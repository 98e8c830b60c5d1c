//! CLI Entry Point for antenna-range
//!
//! Headless shell around the scan controller:
//! - `scan` runs a measurement, printing progress through `tracing`
//! - `position` drives the positioner by hand (home, goto, jog, origin)
//! - `vna` is a soft front panel: format, S-parameter, trace, reset, raw SCPI
//! - `inspect` and `last` summarise recorded scan files
//! - `check-config` prints the effective configuration
//!
//! While a scan runs, type `p` + Enter to pause or resume and `a` + Enter to
//! abort. `--simulate` swaps every instrument for the in-process mock range.
//!
//! # Usage
//!
//! ```bash
//! antenna-range scan --mode xy --phi-step 5 --start-ghz 8 --stop-ghz 12 --points 201 --csv horn_xy
//! antenna-range scan --simulate --mode full --phi-step 30 --theta-step 30 --start-ghz 8 --stop-ghz 12 --points 11 --polarization both --csv demo
//! antenna-range inspect csv/horn_xy.csv
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use antenna_range::config::RangeConfig;
use antenna_range::hardware::mock::MockRange;
use antenna_range::hardware::{HomeAxes, SParameter};
use antenna_range::logging::{self, OutputFormat, TracingConfig};
use antenna_range::review::{self, RecordedBlock};
use antenna_range::scan::params::resolve_csv_path;
use antenna_range::scan::{
    io_runtime, Axis, CartesianPoint, ControlState, MeasurementFormat, PolarizationPlan,
    ScanController, ScanDevices, ScanMode, ScanOutcome, ScanParametersBuilder, ScanState,
    ScanView, SliceSeries,
};
use antenna_range::session::SessionState;
use antenna_range::ui_bridge::create_bridge;

/// Console refresh interval of the main loop.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Simulated positioner travel time per move.
const SIMULATED_MOVE: Duration = Duration::from_millis(15);

#[derive(Parser)]
#[command(name = "antenna-range")]
#[command(about = "Antenna range scan orchestration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = antenna_range::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan and append its blocks to a CSV file
    Scan(ScanArgs),

    /// Manual positioner control
    Position {
        #[command(subcommand)]
        action: PositionAction,

        /// Use simulated instruments
        #[arg(long)]
        simulate: bool,
    },

    /// Manual analyzer control
    Vna {
        #[command(subcommand)]
        action: VnaAction,

        /// Use simulated instruments
        #[arg(long)]
        simulate: bool,
    },

    /// Summarise the blocks of a recorded scan file
    Inspect {
        csv: PathBuf,
    },

    /// Show the most recently recorded scan file
    Last,

    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[derive(Subcommand)]
enum PositionAction {
    /// Home one axis (x, y, z, a) or all
    Home {
        #[arg(default_value = "all")]
        axes: HomeAxes,
    },
    /// Move to an absolute (phi, theta)
    Goto {
        #[arg(allow_hyphen_values = true)]
        phi: f64,
        #[arg(allow_hyphen_values = true)]
        theta: f64,
    },
    /// Move relative to the current position
    Jog {
        #[arg(allow_hyphen_values = true)]
        dphi: f64,
        #[arg(allow_hyphen_values = true)]
        dtheta: f64,
    },
    /// Store the current position as the origin
    SaveOrigin,
    /// Print the reported position
    Show,
}

#[derive(Subcommand)]
enum VnaAction {
    /// Switch the display format (LOGM, PHAS, SMIC, POLA, LINM, SWR, REAL, IMAG)
    Format { format: MeasurementFormat },
    /// Show S11, S12, S21 or S22
    Sparam { sparam: SParameter },
    /// Print the current trace as frequency, value pairs
    Trace,
    /// Reset the instrument
    Reset,
    /// Send a raw command
    Write { command: String },
    /// Send a raw query and print the reply
    Query { command: String },
}

#[derive(Args)]
struct ScanArgs {
    /// full, xy, phi0, phi90 or custom
    #[arg(long)]
    mode: ScanMode,

    /// Test name stored in the block metadata
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    phi_step: Option<f64>,

    #[arg(long)]
    theta_step: Option<f64>,

    /// Fixed axis of a custom slice (phi or theta)
    #[arg(long)]
    fixed_axis: Option<Axis>,

    /// Fixed angle of a custom slice
    #[arg(long, allow_hyphen_values = true)]
    fixed_angle: Option<f64>,

    /// Step of the swept axis of a custom slice
    #[arg(long)]
    step: Option<f64>,

    #[arg(long)]
    start_ghz: f64,

    #[arg(long)]
    stop_ghz: f64,

    #[arg(long)]
    points: u32,

    /// Source power in dBm
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    power: f64,

    #[arg(long, default_value = "LOGM")]
    format: MeasurementFormat,

    /// vertical, horizontal or both
    #[arg(long, default_value = "vertical")]
    polarization: PolarizationPlan,

    /// CSV file; bare names go under the configured CSV directory
    #[arg(long)]
    csv: String,

    /// Read the analyzer as configured on its front panel
    #[arg(long)]
    no_vna_setup: bool,

    /// Use simulated instruments
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RangeConfig::load_from(&cli.config)?;
    config.validate()?;
    let tracing_config = TracingConfig::from_range_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Scan(args) => run_scan(&config, args),
        Commands::Position { action, simulate } => run_position(&config, action, simulate),
        Commands::Vna { action, simulate } => run_vna(&config, action, simulate),
        Commands::Inspect { csv } => inspect(&csv),
        Commands::Last => show_last(&config),
        Commands::CheckConfig => check_config(&cli.config, &config),
    }
}

/// Connect the instruments on `runtime`, or build the simulated range.
fn open_devices(config: &RangeConfig, runtime: &Runtime, simulate: bool) -> Result<ScanDevices> {
    if simulate {
        info!("using simulated instruments");
        let (devices, _log) = MockRange::new()
            .with_rotation_stage()
            .map_positioner(|positioner| positioner.with_move_delay(SIMULATED_MOVE))
            .into_devices();
        return Ok(devices);
    }
    open_hardware(config, runtime)
}

#[cfg(feature = "instrument_serial")]
fn open_hardware(config: &RangeConfig, runtime: &Runtime) -> Result<ScanDevices> {
    use antenna_range::hardware::arduino_stage::ArduinoRotationStage;
    use antenna_range::hardware::grbl::GrblPositioner;
    use antenna_range::hardware::hp8720::Hp8720Vna;

    runtime.block_on(async {
        let positioner = GrblPositioner::open(&config.positioner.port, config.positioner.baud)
            .await
            .with_context(|| format!("opening positioner on {}", config.positioner.port))?;

        let vna = Hp8720Vna::connect(
            &config.vna.host,
            config.vna.port,
            config.vna.gpib_address,
            Duration::from_millis(config.vna.timeout_ms),
        )
        .await
        .with_context(|| format!("connecting to VNA at {}:{}", config.vna.host, config.vna.port))?;

        let mut devices = ScanDevices::new(Box::new(positioner), Box::new(vna));
        let stage = &config.rotation_stage;
        if stage.enabled {
            let rotation = ArduinoRotationStage::open(&stage.port, stage.baud, stage.steps_per_deg)
                .await
                .with_context(|| format!("opening rotation stage on {}", stage.port))?;
            devices = devices.with_rotation_stage(Box::new(rotation));
        }
        Ok(devices)
    })
}

#[cfg(not(feature = "instrument_serial"))]
fn open_hardware(_config: &RangeConfig, _runtime: &Runtime) -> Result<ScanDevices> {
    bail!("built without the 'instrument_serial' feature; use --simulate")
}

fn build_controller(
    config: &RangeConfig,
    simulate: bool,
) -> Result<(ScanController, antenna_range::ui_bridge::UiQueue<dyn ScanView>)> {
    let runtime = io_runtime()?;
    let devices = open_devices(config, &runtime, simulate)?;
    let ids = devices.identities();
    info!(vna = ?ids.vna, positioner = ?ids.positioner, rotation_stage = ?ids.rotation_stage, "instruments ready");

    let session = Arc::new(SessionState::persistent(&config.storage.session_file));
    let (scheduler, queue) = create_bridge::<dyn ScanView>();
    let controller =
        ScanController::with_runtime(devices, runtime, session, scheduler, config.timing());
    Ok((controller, queue))
}

enum ConsoleCommand {
    TogglePause,
    Abort,
}

/// Forward `p` / `a` lines from stdin. The thread ends with stdin.
fn spawn_stdin_reader() -> mpsc::Receiver<ConsoleCommand> {
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let command = match line.trim() {
                    "p" | "pause" | "r" | "resume" => ConsoleCommand::TogglePause,
                    "a" | "abort" | "q" => ConsoleCommand::Abort,
                    "" => continue,
                    other => {
                        warn!("unknown command '{other}' (p = pause/resume, a = abort)");
                        continue;
                    }
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!("console input unavailable: {err}");
    }
    rx
}

fn run_scan(config: &RangeConfig, args: ScanArgs) -> Result<()> {
    let mut builder = ScanParametersBuilder::new(args.mode)
        .sweep(args.start_ghz, args.stop_ghz, args.points)
        .power_dbm(args.power)
        .format(args.format)
        .polarization(args.polarization)
        .csv_path(resolve_csv_path(&config.storage.csv_dir, &args.csv))
        .modify_vna(!args.no_vna_setup);
    if let Some(name) = args.name {
        builder = builder.name(name);
    }
    if let Some(step) = args.phi_step {
        builder = builder.phi_step(step);
    }
    if let Some(step) = args.theta_step {
        builder = builder.theta_step(step);
    }
    if args.mode == ScanMode::CustomSlice {
        let axis = args.fixed_axis.context("--fixed-axis is required for a custom slice")?;
        let angle = args.fixed_angle.context("--fixed-angle is required for a custom slice")?;
        let step = args.step.context("--step is required for a custom slice")?;
        builder = builder.custom_slice(axis, angle, step);
    }
    let params = builder.build()?;
    let csv_path = params.csv_path().to_path_buf();

    let (mut controller, mut queue) = build_controller(config, args.simulate)?;
    let mut view = ConsoleView::default();

    controller.select_mode(params.mode())?;
    controller.start(params)?;
    info!(csv = %csv_path.display(), "scan running; p = pause/resume, a = abort");

    let input = spawn_stdin_reader();
    let outcome = loop {
        queue.pump(&mut view);
        while let Ok(command) = input.try_recv() {
            let result = match command {
                ConsoleCommand::TogglePause => controller.toggle_pause().map(|_| ()),
                ConsoleCommand::Abort => controller.abort(),
            };
            if let Err(err) = result {
                warn!("{err}");
            }
        }
        if let Some(outcome) = controller.poll_finished() {
            queue.pump(&mut view);
            break outcome;
        }
        std::thread::sleep(PUMP_INTERVAL);
    };

    match outcome {
        ScanOutcome::Failed { message } => bail!(message),
        outcome => {
            println!("{}", outcome.status_message());
            println!("Results: {}", csv_path.display());
            Ok(())
        }
    }
}

fn run_position(config: &RangeConfig, action: PositionAction, simulate: bool) -> Result<()> {
    let (mut controller, _queue) = build_controller(config, simulate)?;
    match action {
        PositionAction::Home { axes } => controller.home(axes)?,
        PositionAction::Goto { phi, theta } => controller.goto(phi, theta)?,
        PositionAction::Jog { dphi, dtheta } => {
            controller.jog(dphi, dtheta)?;
        }
        PositionAction::SaveOrigin => controller.save_origin()?,
        PositionAction::Show => {}
    }
    let position = controller.position()?;
    println!(
        "phi = {:.3} deg, theta = {:.3} deg (z = {:.3}, a = {:.3})",
        position[0], position[1], position[2], position[3]
    );
    Ok(())
}

fn run_vna(config: &RangeConfig, action: VnaAction, simulate: bool) -> Result<()> {
    let (mut controller, _queue) = build_controller(config, simulate)?;
    match action {
        VnaAction::Format { format } => controller.vna_format(format)?,
        VnaAction::Sparam { sparam } => controller.vna_sparam(sparam)?,
        VnaAction::Trace => {
            let trace = controller.vna_trace()?;
            println!("Freq (GHz),Value");
            for (freq_ghz, value) in trace.samples() {
                println!("{freq_ghz},{value}");
            }
        }
        VnaAction::Reset => controller.vna_reset()?,
        VnaAction::Write { command } => controller.vna_write(&command)?,
        VnaAction::Query { command } => println!("{}", controller.vna_query(&command)?),
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let blocks = review::parse_pattern_file(path)?;
    if blocks.is_empty() {
        println!("{}: no data blocks", path.display());
        return Ok(());
    }
    println!("{}: {} block(s)", path.display(), blocks.len());
    for (index, block) in blocks.iter().enumerate() {
        print_block(index + 1, block);
    }
    Ok(())
}

fn print_block(number: usize, block: &RecordedBlock) {
    let freqs = block.frequencies();
    let span = match (freqs.first(), freqs.last()) {
        (Some(first), Some(last)) => format!("{first}..{last} GHz ({} points)", freqs.len()),
        _ => "no frequencies".to_string(),
    };
    println!(
        "  [{number}] {} | polarization {} | {} rows | {span}{}",
        block.name().unwrap_or("unnamed"),
        block.polarization().unwrap_or("?"),
        block.rows.len(),
        if block.complete { "" } else { " | INCOMPLETE" },
    );
    if let Some(created) = block
        .metadata
        .as_ref()
        .map(|metadata| metadata.created_local.as_str())
        .or(block.date.as_deref())
    {
        println!("      recorded {created}");
    }
    for (key, value) in &block.meta {
        if key != "polarization" {
            println!("      {key}: {value}");
        }
    }
    if block.skipped_rows > 0 {
        println!("      {} malformed row(s) skipped", block.skipped_rows);
    }
}

fn show_last(config: &RangeConfig) -> Result<()> {
    let session = SessionState::persistent(&config.storage.session_file);
    let (path, blocks) = review::load_last_test(&session)?;
    if let Some(snapshot) = session.snapshot() {
        println!("Last scan: {} ({})", snapshot.scan_name, snapshot.recorded_utc);
    }
    println!("{}: {} block(s)", path.display(), blocks.len());
    for (index, block) in blocks.iter().enumerate() {
        print_block(index + 1, block);
    }
    Ok(())
}

fn check_config(path: &Path, config: &RangeConfig) -> Result<()> {
    println!("# {} (validated)", path.display());
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Console rendering of the scan view: status and progress as log lines.
#[derive(Default)]
struct ConsoleView {
    last_decile: Option<u32>,
    points_plotted: usize,
}

impl ScanView for ConsoleView {
    fn set_status(&mut self, text: &str) {
        info!("{text}");
    }

    fn set_progress(&mut self, fraction: f64) {
        let decile = (fraction.clamp(0.0, 1.0) * 10.0).floor() as u32;
        if self.last_decile != Some(decile) {
            self.last_decile = Some(decile);
            info!("progress {}%", decile * 10);
        }
    }

    fn show_progress(&mut self, visible: bool) {
        if !visible {
            self.last_decile = None;
        }
    }

    fn set_controls(&mut self, _controls: ControlState) {}

    fn state_changed(&mut self, state: ScanState) {
        tracing::debug!(%state, "scan state");
    }

    fn render_points(&mut self, points: &[CartesianPoint]) {
        self.points_plotted += points.len();
    }

    fn render_slice(&mut self, freq_ghz: f64, series: &SliceSeries) {
        tracing::debug!(freq_ghz, samples = series.len(), "slice updated");
    }

    fn set_frequency_choices(&mut self, freqs_ghz: &[f64]) {
        tracing::debug!(count = freqs_ghz.len(), "frequency choices updated");
    }

    fn scan_finished(&mut self, outcome: &ScanOutcome) {
        if self.points_plotted > 0 {
            info!(points = self.points_plotted, "3D pattern points received");
        }
        info!(?outcome, "scan finished");
    }
}
