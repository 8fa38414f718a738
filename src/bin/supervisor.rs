use clap::{App, Arg};
use colored::*;
use linmot_supervisor::config::SupervisorConfig;
use linmot_supervisor::heartbeat::LivenessTracker;
use linmot_supervisor::session::{Session, SessionSummary};
use linmot_supervisor::sim::SimulatedDrive;
use linmot_supervisor::telemetry::{BroadcastSink, TelemetryFrame, CSV_HEADER, FRAME_BROADCAST_CAPACITY};
use linmot_supervisor::SupervisorState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

const BUS_CYCLE_MS: u64 = 10;
const DEFAULT_DURATION_S: &str = "30";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Table,
    Csv,
}

impl OutputFormat {
    fn parse(value: &str) -> Self {
        match value {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn parse_code(value: &str) -> Result<u16, String> {
    let trimmed = value.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|_| format!("'{}' is not a hex error code", value))
}

fn parse_seconds(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("'{}' is not a whole number of seconds", value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("linmot-supervisor")
        .version("0.1.0")
        .author("Motion Systems Engineering Team")
        .about("⚙️  LinMot drive supervisor running against a simulated drive")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON supervisor configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("How long to run the session")
                .takes_value(true)
                .default_value(DEFAULT_DURATION_S)
                .validator(|v| parse_seconds(&v).map(|_| ())),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Telemetry output format")
                .takes_value(true)
                .possible_values(&["json", "table", "csv"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("inject-fault")
                .long("inject-fault")
                .value_name("CODE")
                .help("Raise this drive error code (hex) halfway through the run")
                .takes_value(true)
                .validator(|v| parse_code(&v).map(|_| ())),
        )
        .arg(
            Arg::with_name("drop-link-at")
                .long("drop-link-at")
                .value_name("SECONDS")
                .help("Drop the drive out of operational state after this many seconds")
                .takes_value(true)
                .validator(|v| parse_seconds(&v).map(|_| ())),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match matches.value_of("config") {
        Some(path) => SupervisorConfig::from_json_file(path)?,
        None => SupervisorConfig::default(),
    };
    let duration_s = parse_seconds(matches.value_of("duration").unwrap_or(DEFAULT_DURATION_S))?;
    let format = OutputFormat::parse(matches.value_of("format").unwrap_or("table"));

    let drive = Arc::new(SimulatedDrive::new());
    let tracker = Arc::new(LivenessTracker::new());
    drive.attach_liveness(Arc::clone(&tracker));

    let (sink, mut frames) = BroadcastSink::new(FRAME_BROADCAST_CAPACITY);
    let handle = Session::new(Arc::clone(&drive), config, tracker).spawn(sink);
    let bus_cycle = Arc::clone(&drive).spawn_cycle(Duration::from_millis(BUS_CYCLE_MS), handle.shutdown_signal());

    if let Some(code) = matches.value_of("inject-fault") {
        let code = parse_code(code)?;
        let fault_drive = Arc::clone(&drive);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration_s) / 2).await;
            info!("🔧 Injecting drive error {:#06x}", code);
            fault_drive.inject_error(code);
        });
    }

    if let Some(at) = matches.value_of("drop-link-at") {
        let at = parse_seconds(at)?;
        let link_drive = Arc::clone(&drive);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(at)).await;
            info!("🔌 Interrupting drive link");
            link_drive.interrupt_link();
        });
    }

    print_banner(format);

    let deadline = tokio::time::sleep(Duration::from_secs(duration_s));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping session");
                break;
            }
            frame = frames.recv() => match frame {
                Ok(frame) => print_frame(&frame, format)?,
                Err(RecvError::Lagged(skipped)) => warn!("Telemetry output lagged, {} frames skipped", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let summary = handle.shutdown().await?;
    bus_cycle.await?;
    print_summary(&summary, format)?;

    Ok(())
}

fn print_banner(format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("{}", "⚙️  LinMot Drive Supervisor".bright_blue().bold());
            println!(
                "{}",
                format!(
                    "{:>9} {:<18} {:>7} {:>4} {:>6} {:>6} {:>6} {:>6}",
                    "time_ms", "state", "status", "run", "pos", "demand", "temp", "loss"
                )
                .bright_white()
                .bold()
            );
        }
        OutputFormat::Csv => println!("{}", CSV_HEADER),
        OutputFormat::Json => {}
    }
}

fn state_colored(state: SupervisorState) -> ColoredString {
    let label = format!("{:<18}", state.label());
    match state {
        SupervisorState::FaultUnknown => label.bright_red().bold(),
        SupervisorState::FaultRecoverable => label.yellow(),
        SupervisorState::Moving | SupervisorState::ActiveIdle => label.green(),
        _ => label.cyan(),
    }
}

fn print_frame(frame: &TelemetryFrame, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(frame)?),
        OutputFormat::Csv => {
            let line = frame.to_csv_line().map_err(|_| "CSV line exceeds buffer")?;
            println!("{}", line);
        }
        OutputFormat::Table => println!(
            "{:>9} {} {:>#7x} {:>4} {:>6} {:>6} {:>6} {:>6}",
            frame.timestamp_ms,
            state_colored(frame.state),
            frame.status_word,
            frame.run_state,
            frame.actual_position,
            frame.demand_position,
            frame.real_temp,
            frame.power_loss
        ),
    }
    Ok(())
}

fn print_summary(summary: &SessionSummary, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Csv => {}
        OutputFormat::Table => {
            println!("\n{}", "📊 Session Summary".bright_blue().bold());
            println!("  Final state:        {}", state_colored(summary.final_state));
            println!("  Supervisor ticks:   {}", summary.supervisor.ticks);
            println!("  Moves dispatched:   {}", summary.supervisor.moves_dispatched.to_string().bright_green());
            println!("  Homing runs:        {}", summary.supervisor.homing_runs);
            println!("  Enable attempts:    {}", summary.supervisor.enable_attempts);
            println!("  Fault acks:         {}", summary.supervisor.acknowledge_pulses.to_string().yellow());
            println!("  Liveness outages:   {}", summary.heartbeat.outages);
            println!("  Re-sync commands:   {}", summary.heartbeat.resync_commands);
            println!("  Longest frame gap:  {} ms", summary.heartbeat.longest_gap_ms);
            println!("  Telemetry frames:   {}", summary.telemetry.frames_reported);
        }
    }
    Ok(())
}
