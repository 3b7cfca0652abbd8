mod config;

use chrono::Utc;
use clap::{Parser, Subcommand};
use crossbeam_channel::select;
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use rusty_sweep::{
    AcquisitionResult, AmplitudeSweepParams, AmplitudeSweepRun, BusTransport, Engine,
    EngineHandle, FixedSettle, MachineSettings, Outcome, Payload, PrologixTransport, RunStatus,
    SettingsExport, SimulatedAnalyzer, WorkflowRequest, export, peaks_for_run, plot_fit,
    plot_series, plot_trace,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, ConfigSource, load_config_or_default};

/// HP4195A sweep tool
#[derive(Parser, Debug)]
#[command(name = "sweep")]
#[command(about = "Measurement sweeps on an HP4195A network/spectrum analyzer", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Talk to a simulated analyzer instead of the GPIB adapter
    #[arg(long)]
    simulate: bool,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the instrument identity
    Identify,
    /// Read the current traces
    Acquire,
    /// Single sweep around a center frequency
    PeakScan {
        #[arg(long)]
        center: f64,
        #[arg(long)]
        span: f64,
    },
    /// Single sweep between two frequencies
    RangeScan {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        stop: f64,
    },
    /// Single sweep at 10 Hz resolution bandwidth
    LowRes,
    /// Acquire and fit the resonance
    QFactor,
    /// One sweep per oscillator amplitude, start..=stop in dBm
    AmplitudeSweep {
        #[arg(long, allow_hyphen_values = true)]
        start: f64,
        #[arg(long, allow_hyphen_values = true)]
        stop: f64,
        #[arg(long)]
        step: f64,
        /// Resolution bandwidth for every step (Hz)
        #[arg(long)]
        rbw: Option<f64>,
    },
    /// Read the instrument settings
    Settings {
        /// Also write them to this JSON file
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
    },
    /// Send a raw query, e.g. "RBW?"
    Query { command: String },
}

const SIMULATED_RESONANCE_HZ: f64 = 1.0e6;
const SIMULATED_Q: f64 = 500.0;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let (config, source) = load_config_or_default(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or(config.console.verbosity.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, &source, &args);

    let handle = setup_engine(&config, args.simulate)?;
    setup_shutdown_handler(&handle)?;

    let identity = match wait_for(&handle, WorkflowRequest::Connect)? {
        Some(Payload::Identity(identity)) => identity,
        _ => String::from("unknown"),
    };
    info!("Connected to {identity}");

    let result = run_command(&handle, &config, args.command, &identity);
    if let Err(e) = &result {
        error!("✗ {e}");
    }

    info!("Cleaning up and shutting down...");
    if handle.state().is_connected() {
        if let Err(e) = wait_for(&handle, WorkflowRequest::Disconnect) {
            warn!("Disconnect failed: {e}");
        }
    }
    handle.shutdown();
    info!("Cleanup complete");

    result
}

fn setup_engine(
    config: &AppConfig,
    simulate: bool,
) -> Result<EngineHandle, Box<dyn std::error::Error>> {
    let mut engine_config = config.engine_config();
    let transport: Box<dyn BusTransport> = if simulate {
        info!("Using simulated analyzer");
        engine_config.settle = Arc::new(FixedSettle(Duration::ZERO));
        Box::new(SimulatedAnalyzer::new(SIMULATED_RESONANCE_HZ, SIMULATED_Q))
    } else {
        Box::new(
            PrologixTransport::builder()
                .config(config.connection())
                .build(),
        )
    };
    Ok(Engine::spawn(transport, engine_config)?)
}

/// Ctrl+C stops a running amplitude sweep after its current step
fn setup_shutdown_handler(handle: &EngineHandle) -> Result<(), Box<dyn std::error::Error>> {
    let token = handle.cancel_token();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current step...");
        token.cancel();
    })?;
    Ok(())
}

/// Submit a request and block until its outcome arrives
fn wait_for(
    handle: &EngineHandle,
    request: WorkflowRequest,
) -> Result<Option<Payload>, Box<dyn std::error::Error>> {
    let ticket = handle.submit(request)?;
    loop {
        let outcome = handle.outcomes().recv()?;
        if outcome.ticket == ticket {
            return outcome_result(outcome);
        }
    }
}

fn outcome_result(outcome: Outcome) -> Result<Option<Payload>, Box<dyn std::error::Error>> {
    match outcome.error {
        None => Ok(outcome.data),
        Some(e) => Err(e.into()),
    }
}

fn run_command(
    handle: &EngineHandle,
    config: &AppConfig,
    command: Command,
    identity: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Identify => {
            println!("{identity}");
            Ok(())
        }
        Command::Acquire => measure(handle, config, WorkflowRequest::Acquire),
        Command::PeakScan { center, span } => {
            measure(handle, config, WorkflowRequest::PeakScan { center, span })
        }
        Command::RangeScan { start, stop } => {
            measure(handle, config, WorkflowRequest::RangeScan { start, stop })
        }
        Command::LowRes => measure(handle, config, WorkflowRequest::LowResSweep),
        Command::QFactor => q_factor(handle, config),
        Command::AmplitudeSweep {
            start,
            stop,
            step,
            rbw,
        } => {
            let params = AmplitudeSweepParams::from_range(start, stop, step, rbw)?;
            amplitude_sweep(handle, config, params)
        }
        Command::Settings { export } => settings(handle, export.as_deref()),
        Command::Query { command } => {
            if let Some(Payload::Response(text)) =
                wait_for(handle, WorkflowRequest::RawQuery(command))?
            {
                println!("{text}");
            }
            Ok(())
        }
    }
}

fn measure(
    handle: &EngineHandle,
    config: &AppConfig,
    request: WorkflowRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(Payload::Acquisition { result, peak }) = wait_for(handle, request)? else {
        return Err("no acquisition returned".into());
    };
    if let Some(peak) = peak {
        info!(
            "✓ Peak at {:.3} Hz, {:.2} dBm (point {})",
            peak.frequency, peak.magnitude, peak.index
        );
    }
    save_trace(config, &result)?;
    if config.export.plot {
        plot_trace(&result, Some("Magnitude"), None, None)?;
    }
    Ok(())
}

fn q_factor(handle: &EngineHandle, config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Some(Payload::Acquisition { result, .. }) = wait_for(handle, WorkflowRequest::Acquire)?
    else {
        return Err("no acquisition returned".into());
    };
    let Some(Payload::QFactor(fit)) = wait_for(handle, WorkflowRequest::QFactor)? else {
        return Err("no fit returned".into());
    };

    if fit.fit_succeeded {
        info!(
            "✓ Q = {:.1} at {:.3} Hz (FWHM {:.3} Hz, R² {:.3}, {} iterations)",
            fit.q_value, fit.center_frequency, fit.fwhm, fit.r_squared, fit.iterations
        );
    } else {
        warn!("✗ Lorentzian fit did not converge");
    }
    save_trace(config, &result)?;
    if config.export.plot {
        plot_fit(&result, &fit, None, None)?;
    }
    Ok(())
}

fn amplitude_sweep(
    handle: &EngineHandle,
    config: &AppConfig,
    params: AmplitudeSweepParams,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting amplitude sweep: {} steps, Ctrl+C to stop early",
        params.amplitudes().len()
    );
    let ticket = handle.submit(WorkflowRequest::AmplitudeSweep(params))?;

    let outcome = loop {
        select! {
            recv(handle.progress()) -> progress => {
                if let Some(p) = progress.ok().filter(|p| p.ticket == ticket) {
                    info!(
                        "Step {}/{} complete ({} dBm)",
                        p.step_index + 1,
                        p.total_steps,
                        p.amplitude
                    );
                }
            }
            recv(handle.outcomes()) -> outcome => {
                let outcome = outcome?;
                if outcome.ticket == ticket {
                    break outcome;
                }
            }
        }
    };

    let error = outcome.error.clone();
    let Some(Payload::AmplitudeSweep(run)) = outcome.data else {
        return match error {
            Some(e) => Err(e.into()),
            None => Err("no sweep returned".into()),
        };
    };
    report_run(config, &run)?;
    match error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn report_run(config: &AppConfig, run: &AmplitudeSweepRun) -> Result<(), Box<dyn std::error::Error>> {
    match run.status() {
        RunStatus::Completed => info!("✓ Amplitude sweep completed"),
        RunStatus::Cancelled => info!("✓ Amplitude sweep stopped by user"),
        RunStatus::Failed => error!("✗ Amplitude sweep failed"),
        RunStatus::InProgress => {}
    }
    info!("{} of {} steps recorded", run.completed_steps(), run.total_steps());
    if run.completed_steps() == 0 {
        return Ok(());
    }

    let dir = Path::new(&config.export.output_dir)
        .join(format!("amplitude_sweep_{}", Utc::now().format("%Y%m%d_%H%M%S")));
    let files = export::export_sweep_run(&dir, run)?;
    info!("Wrote {} files to {}", files.len(), dir.display());

    if config.export.plot {
        let points: Vec<(f64, f64)> = run
            .amplitudes()
            .iter()
            .zip(peaks_for_run(run))
            .filter_map(|(&amp, peak)| peak.ok().map(|p| (amp, p.magnitude)))
            .collect();
        plot_series(
            &points,
            "Peak magnitude per step",
            "Oscillator amplitude (dBm)",
            "Peak magnitude (dBm)",
        )?;
    }
    Ok(())
}

fn settings(handle: &EngineHandle, export: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(Payload::Settings(settings)) = wait_for(handle, WorkflowRequest::ReadSettings)? else {
        return Err("no settings returned".into());
    };
    print_settings(&settings);
    if let Some(path) = export {
        SettingsExport::new(settings).save(path)?;
        info!("✓ Settings exported to {}", path.display());
    }
    Ok(())
}

fn print_settings(settings: &MachineSettings) {
    let show = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| "Unknown".to_string());
    println!("Device ID                    {}", settings.device_id.as_deref().unwrap_or("Unknown"));
    println!("Connection Status            {:?}", settings.connection_status);
    println!("Center Frequency (Hz)        {}", show(settings.center_frequency));
    println!("Span (Hz)                    {}", show(settings.span));
    println!("Start Frequency (Hz)         {}", show(settings.start_frequency));
    println!("Stop Frequency (Hz)          {}", show(settings.stop_frequency));
    println!("Resolution Bandwidth (Hz)    {}", show(settings.resolution_bandwidth));
    println!("Oscillator 1 Amplitude (dBm) {}", show(settings.oscillator_1_amplitude));
    println!(
        "Sweep Mode                   {}",
        settings
            .sweep_mode
            .map(|m| m.to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    );
}

fn save_trace(config: &AppConfig, result: &AcquisitionResult) -> Result<(), Box<dyn std::error::Error>> {
    let dir = PathBuf::from(&config.export.output_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("hp4195a_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")));
    export::save_acquisition(&path, result)?;
    info!("Saved trace to {}", path.display());
    Ok(())
}

/// Log startup information
fn log_startup_info(config: &AppConfig, source: &ConfigSource, args: &Args) {
    info!("=== HP4195A Sweep Tool ===");
    match source {
        ConfigSource::Loaded => info!("Configuration loaded successfully"),
        ConfigSource::Defaults(e) => warn!("No usable configuration file ({e}), using defaults"),
    }
    if let Some(path) = &args.config {
        info!("Configuration: {}", path.display());
    }
    if args.simulate {
        info!("Instrument: simulated {}", config.instrument.device_id);
    } else {
        info!(
            "Instrument: {} at {}",
            config.instrument.device_id,
            config.bus_address()
        );
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()?;

    Ok(())
}
