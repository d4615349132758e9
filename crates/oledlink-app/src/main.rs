mod config;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AppConfig, DecodeFailure};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use oledlink_codec::{decode, encode};
use oledlink_core::{
    list_ports, BridgeEvent, BridgeService, BridgeState, RawSnapshot, RunOutcome, Severity,
    SimulatedSource, SystemPorts, TelemetrySource, TimedSource,
};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Forwards hardware monitoring telemetry to a serial OLED display.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: <config dir>/oledlink/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    List,
    /// Bridge telemetry to a port until Ctrl-C or Enter
    Run(RunArgs),
    /// Poll the telemetry source once and print what would be sent
    Probe(SourceArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Serial port (defaults to the last one used)
    #[arg(short, long)]
    port: Option<String>,

    /// Milliseconds between lines
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Upper bound for one telemetry poll, in milliseconds
    #[arg(long)]
    poll_timeout_ms: Option<u64>,

    /// End the run on malformed telemetry instead of sending the fallback line
    #[arg(long)]
    stop_on_decode_error: bool,

    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Use synthetic readings instead of the native accessor
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli.config.clone().or_else(AppConfig::default_path);
    let mut config = match &config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Command::List => list(),
        Command::Probe(args) => probe(&config, &args),
        Command::Run(args) => run(&mut config, config_path.as_deref(), args),
    }
}

fn list() -> Result<()> {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No available serial ports.");
        return Ok(());
    }
    for port in ports {
        match &port.description {
            Some(description) => println!("{:<28} {} {description}", port.display_name(), port.kind),
            None => println!("{:<28} {}", port.display_name(), port.kind),
        }
    }
    Ok(())
}

fn open_source(args: &SourceArgs) -> Result<Box<dyn TelemetrySource>> {
    if args.simulate {
        return Ok(Box::new(SimulatedSource::new()));
    }
    #[cfg(feature = "afterburner")]
    {
        Ok(Box::new(oledlink_core::AfterburnerSource))
    }
    #[cfg(not(feature = "afterburner"))]
    {
        bail!("built without the `afterburner` feature; pass --simulate to use synthetic readings")
    }
}

fn probe(config: &AppConfig, args: &SourceArgs) -> Result<()> {
    let source = open_source(args)?;
    let timeout = Duration::from_millis(config.poll_timeout_ms.max(1));
    let mut source = TimedSource::spawn(source, timeout).context("starting telemetry thread")?;

    let mut snapshot = RawSnapshot::new();
    let len = snapshot.fill_from(&mut source);
    if len <= 0 {
        println!("{}", encode(None));
        bail!("no telemetry available (source returned {len}); is the monitoring host running?");
    }

    let frame = decode(snapshot.buffer(), len)?;
    println!("{}", serde_json::to_string_pretty(&frame)?);
    println!("{}", encode(Some(&frame)));
    Ok(())
}

fn run(config: &mut AppConfig, config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    if let Some(ms) = args.interval_ms {
        config.interval_ms = ms;
    }
    if let Some(ms) = args.poll_timeout_ms {
        config.poll_timeout_ms = ms;
    }
    if args.stop_on_decode_error {
        config.decode_failure = DecodeFailure::Stop;
    }
    let settings = config.to_settings()?;
    let port = args.port.or_else(|| config.last_port.clone());

    let source = open_source(&args.source)?;
    let mut service = BridgeService::new(SystemPorts, source, settings)?;
    let handle = service
        .start(port.as_deref())
        .context("pass --port, see `oledlink list` for candidates")?;

    let mut memory = PortMemory::new(config_path, port);
    let rx_stop = stop_requests(BufReader::new(std::io::stdin()))?;
    log::info!("press Enter or Ctrl-C to stop");

    let mut stop_sent = false;
    let outcome = loop {
        if !stop_sent && rx_stop.try_recv().is_ok() {
            log::info!("stopping");
            service.stop(handle);
            stop_sent = true;
        }
        match service.events().recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                render(&event);
                memory.observe(config, &event);
                if let BridgeEvent::Finished(outcome) = event {
                    break outcome;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("bridge event stream closed"),
        }
    };
    service.wait();

    match outcome {
        RunOutcome::Cancelled => Ok(()),
        fault => Err(anyhow!("{fault}")),
    }
}

fn render(event: &BridgeEvent) {
    match event {
        BridgeEvent::StateChanged(state) => log::debug!("state: {state}"),
        BridgeEvent::Status { severity: Severity::Critical, message } => log::error!("{message}"),
        BridgeEvent::Status { severity: Severity::Recoverable, message } => log::warn!("{message}"),
        BridgeEvent::Status { severity: Severity::Informational, message } => log::info!("{message}"),
        BridgeEvent::LineSent(line) => log::debug!("sent {line}"),
        BridgeEvent::Finished(outcome) => log::info!("finished: {outcome}"),
    }
}

/// Saves the port once the run has actually opened it.
struct PortMemory<'a> {
    path: Option<&'a Path>,
    port: Option<String>,
}

impl<'a> PortMemory<'a> {
    fn new(path: Option<&'a Path>, port: Option<String>) -> Self {
        Self { path, port }
    }

    fn observe(&mut self, config: &mut AppConfig, event: &BridgeEvent) {
        if *event != BridgeEvent::StateChanged(BridgeState::Running) {
            return;
        }
        let (Some(path), Some(port)) = (self.path, self.port.take()) else {
            return;
        };
        config.last_port = Some(port);
        if let Err(e) = config.save(path) {
            log::warn!("could not remember the port: {e:#}");
        }
    }
}

/// Fires on Ctrl-C / SIGTERM, or when a line is entered on `input`.
/// End of input is not a stop request, so the bridge keeps running detached.
fn stop_requests<R>(input: R) -> Result<Receiver<()>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = unbounded();

    let tx_signal = tx.clone();
    ctrlc::set_handler(move || {
        let _ = tx_signal.send(());
    })
    .context("installing the Ctrl-C handler")?;

    watch_input(input, tx);
    Ok(rx)
}

fn watch_input<R>(mut input: R, tx: Sender<()>)
where
    R: BufRead + Send + 'static,
{
    std::thread::spawn(move || {
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) => log::debug!("stdin closed, Enter-to-stop disabled"),
            Ok(_) => {
                let _ = tx.send(());
            }
            Err(e) => log::debug!("stdin unreadable ({e}), Enter-to-stop disabled"),
        }
    });
}
