use clap::{App, Arg, ArgMatches, SubCommand};
use colored::Colorize;
use plcsim::channel::ChannelAddress;
use plcsim::instrument::DisplayState;
use plcsim::protocol::{ServerCommand, ServerResponse};
use plcsim::scheduler::{InstrumentStatus, Snapshot};
use plcsim::topology::{InstrumentRecord, TopologyFile};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";

fn main() {
    let matches = App::new("plcsim")
        .version("0.1.0")
        .about("PLC instrument simulator control client")
        .arg(
            Arg::with_name("host")
                .long("host")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .help("Simulator host"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .help("Simulator TCP port"),
        )
        .subcommand(SubCommand::with_name("snapshot").about("Print the current plant snapshot"))
        .subcommand(SubCommand::with_name("stats").about("Print engine statistics"))
        .subcommand(SubCommand::with_name("list").about("List configured instruments"))
        .subcommand(SubCommand::with_name("watch").about("Stream snapshots as they are published"))
        .subcommand(
            SubCommand::with_name("set-digital")
                .about("Drive a mock digital input")
                .arg(Arg::with_name("pin").long("pin").takes_value(true))
                .arg(Arg::with_name("i2c").long("i2c").takes_value(true))
                .arg(Arg::with_name("channel").long("channel").takes_value(true))
                .arg(
                    Arg::with_name("value")
                        .long("value")
                        .takes_value(true)
                        .required(true)
                        .possible_values(&["on", "off"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("set-analog")
                .about("Drive a mock analog input (0.0..=1.0)")
                .arg(Arg::with_name("pin").long("pin").takes_value(true))
                .arg(Arg::with_name("i2c").long("i2c").takes_value(true))
                .arg(Arg::with_name("channel").long("channel").takes_value(true))
                .arg(
                    Arg::with_name("value")
                        .long("value")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Add an instrument from a record file")
                .arg(
                    Arg::with_name("file")
                        .long("file")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("update")
                .about("Reconfigure an instrument from a record file")
                .arg(
                    Arg::with_name("file")
                        .long("file")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("remove")
                .about("Remove an instrument")
                .arg(
                    Arg::with_name("id")
                        .long("id")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("load")
                .about("Replace the whole topology from a file")
                .arg(
                    Arg::with_name("file")
                        .long("file")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(SubCommand::with_name("start").about("Resume the simulation loop"))
        .subcommand(SubCommand::with_name("stop").about("Pause the simulation loop"))
        .subcommand(SubCommand::with_name("shutdown").about("Stop the simulator"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT);
    let endpoint = format!("{}:{}", host, port);

    let result = match matches.subcommand() {
        ("snapshot", _) => run_snapshot(&endpoint),
        ("stats", _) => run_stats(&endpoint),
        ("list", _) => run_list(&endpoint),
        ("watch", _) => run_watch(&endpoint),
        ("set-digital", Some(sub)) => run_set_digital(&endpoint, sub),
        ("set-analog", Some(sub)) => run_set_analog(&endpoint, sub),
        ("add", Some(sub)) => run_record_edit(&endpoint, sub, RecordEdit::Add),
        ("update", Some(sub)) => run_record_edit(&endpoint, sub, RecordEdit::Update),
        ("remove", Some(sub)) => run_remove(&endpoint, sub),
        ("load", Some(sub)) => run_load(&endpoint, sub),
        ("start", _) => expect_command(&endpoint, &ServerCommand::Start),
        ("stop", _) => expect_command(&endpoint, &ServerCommand::Stop),
        ("shutdown", _) => run_shutdown(&endpoint),
        _ => {
            eprintln!("{}", "No subcommand given; try --help".yellow());
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

enum RecordEdit {
    Add,
    Update,
}

/// Send one command and return the first matching response, skipping over
/// streamed snapshot lines that may arrive in between.
fn send_command(
    endpoint: &str,
    command: &ServerCommand,
    want_snapshot: bool,
) -> Result<ServerResponse, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(endpoint)?;
    let mut payload = serde_json::to_string(command)?;
    payload.push('\n');
    stream.write_all(payload.as_bytes())?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err("server closed the connection".into());
        }
        let response: ServerResponse = serde_json::from_str(line.trim())?;
        let is_stream_line = matches!(response, ServerResponse::Snapshot { .. }) && !want_snapshot;
        if !is_stream_line {
            return Ok(response);
        }
    }
}

fn expect_ok(response: ServerResponse) -> CliResult {
    match response {
        ServerResponse::Ok { detail } => {
            match detail {
                Some(detail) => println!("{} {}", "✓".green().bold(), detail),
                None => println!("{}", "✓ ok".green().bold()),
            }
            Ok(())
        }
        ServerResponse::Error { message } => Err(message.into()),
        other => Err(format!("unexpected response: {:?}", other).into()),
    }
}

fn run_snapshot(endpoint: &str) -> CliResult {
    match send_command(endpoint, &ServerCommand::Snapshot, true)? {
        ServerResponse::Snapshot { snapshot } => {
            print_snapshot(&snapshot);
            Ok(())
        }
        ServerResponse::Error { message } => Err(message.into()),
        other => Err(format!("unexpected response: {:?}", other).into()),
    }
}

fn run_stats(endpoint: &str) -> CliResult {
    match send_command(endpoint, &ServerCommand::Stats, false)? {
        ServerResponse::Stats { stats } => {
            println!("{}", "Engine statistics".bold());
            println!("  generation:        {}", stats.generation);
            println!("  instruments:       {}", stats.instruments);
            println!("  ticks:             {}", stats.scheduler.ticks);
            println!("  overruns:          {}", stats.scheduler.overruns);
            println!("  instrument faults: {}", stats.scheduler.instrument_faults);
            println!("  last tick:         {} us", stats.scheduler.last_tick_us);
            println!(
                "  channel traffic:   {} reads / {} writes",
                stats.channels.reads, stats.channels.writes
            );
            println!(
                "  channel faults:    {} read / {} write",
                stats.channels.read_faults, stats.channels.write_faults
            );
            Ok(())
        }
        ServerResponse::Error { message } => Err(message.into()),
        other => Err(format!("unexpected response: {:?}", other).into()),
    }
}

fn run_list(endpoint: &str) -> CliResult {
    match send_command(endpoint, &ServerCommand::ListInstruments, false)? {
        ServerResponse::Instruments { records } => {
            if records.is_empty() {
                println!("{}", "no instruments configured".yellow());
                return Ok(());
            }
            for record in records {
                let links = if record.links.is_empty() {
                    String::new()
                } else {
                    let mut pairs: Vec<String> = record
                        .links
                        .iter()
                        .map(|(role, target)| format!("{} -> {}", role, target))
                        .collect();
                    pairs.sort();
                    format!("  [{}]", pairs.join(", "))
                };
                println!(
                    "{:16} {}{}",
                    record.id.bold(),
                    record.kind.name(),
                    links
                );
            }
            Ok(())
        }
        ServerResponse::Error { message } => Err(message.into()),
        other => Err(format!("unexpected response: {:?}", other).into()),
    }
}

fn run_watch(endpoint: &str) -> CliResult {
    let stream = TcpStream::connect(endpoint)?;
    let reader = BufReader::new(stream);
    println!("{}", "watching snapshots (Ctrl+C to stop)".bold());
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(ServerResponse::Snapshot { snapshot }) = serde_json::from_str(line.trim()) {
            print_snapshot(&snapshot);
        }
    }
    Ok(())
}

fn parse_address(sub: &ArgMatches) -> Result<ChannelAddress, Box<dyn std::error::Error>> {
    match (sub.value_of("pin"), sub.value_of("i2c")) {
        (Some(pin), None) => Ok(ChannelAddress::Pin(pin.parse()?)),
        (None, Some(i2c)) => {
            let channel = sub
                .value_of("channel")
                .ok_or("--i2c needs --channel")?
                .parse()?;
            Ok(ChannelAddress::Bus {
                address: parse_u8_maybe_hex(i2c)?,
                channel,
            })
        }
        _ => Err("give exactly one of --pin or --i2c".into()),
    }
}

fn parse_u8_maybe_hex(raw: &str) -> Result<u8, std::num::ParseIntError> {
    match raw.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}

fn run_set_digital(endpoint: &str, sub: &ArgMatches) -> CliResult {
    let address = parse_address(sub)?;
    let value = sub.value_of("value") == Some("on");
    expect_ok(send_command(
        endpoint,
        &ServerCommand::SetDigitalInput { address, value },
        false,
    )?)
}

fn run_set_analog(endpoint: &str, sub: &ArgMatches) -> CliResult {
    let address = parse_address(sub)?;
    let value: f64 = sub.value_of("value").ok_or("--value required")?.parse()?;
    expect_ok(send_command(
        endpoint,
        &ServerCommand::SetAnalogInput { address, value },
        false,
    )?)
}

fn run_record_edit(endpoint: &str, sub: &ArgMatches, edit: RecordEdit) -> CliResult {
    let path = sub.value_of("file").ok_or("--file required")?;
    let raw = std::fs::read_to_string(path)?;
    let record: InstrumentRecord = serde_json::from_str(&raw)?;
    let command = match edit {
        RecordEdit::Add => ServerCommand::AddInstrument { record },
        RecordEdit::Update => ServerCommand::UpdateInstrument { record },
    };
    expect_ok(send_command(endpoint, &command, false)?)
}

fn run_remove(endpoint: &str, sub: &ArgMatches) -> CliResult {
    let id = sub.value_of("id").ok_or("--id required")?.to_string();
    expect_ok(send_command(
        endpoint,
        &ServerCommand::RemoveInstrument { id },
        false,
    )?)
}

fn run_load(endpoint: &str, sub: &ArgMatches) -> CliResult {
    let path = sub.value_of("file").ok_or("--file required")?;
    let raw = std::fs::read_to_string(path)?;
    let file: TopologyFile = serde_json::from_str(&raw)?;
    expect_ok(send_command(
        endpoint,
        &ServerCommand::ReplaceTopology {
            records: file.instruments,
        },
        false,
    )?)
}

fn expect_command(endpoint: &str, command: &ServerCommand) -> CliResult {
    expect_ok(send_command(endpoint, command, false)?)
}

fn run_shutdown(endpoint: &str) -> CliResult {
    expect_ok(send_command(endpoint, &ServerCommand::Shutdown, false)?)
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "{} generation {}  tick {}",
        "Snapshot".bold(),
        snapshot.generation,
        snapshot.seq
    );
    for (id, status) in &snapshot.instruments {
        println!("  {:16} {}", id.bold(), describe(status));
    }
}

fn describe(status: &InstrumentStatus) -> String {
    let mut flags = String::new();
    if status.faulted {
        flags.push_str(&format!(" {}", "FAULTED".red().bold()));
    }
    if status.degraded {
        flags.push_str(&format!(" {}", "degraded".yellow()));
    }
    let body = match &status.display {
        DisplayState::Level(d) => format!(
            "level {:7.1} mm ({:5.1} %)  volume {:6.3} m3{}",
            d.level_mm,
            d.level_percent,
            d.volume_m3,
            if d.hh_alarm {
                format!("  {}", "HH".red().bold())
            } else {
                String::new()
            }
        ),
        DisplayState::Valve(d) => {
            format!("{:?}  position {:5.1} %", d.status, d.position_percent)
        }
        DisplayState::Pump(d) => format!(
            "{:?}  speed {:5.1} %  {:5.2} bar  {:6.1} L/min",
            d.status, d.speed_percent, d.pressure_bar, d.flow_lpm
        ),
        DisplayState::Flow(d) => format!(
            "{:6.1} L/min  total {:9.2} L  pulses {}",
            d.flow_lpm, d.total_volume_l, d.pulse_count
        ),
        DisplayState::RegValve(d) => format!(
            "position {:5.1} % (setpoint {:5.1} %)  {:5.2} bar",
            d.position_percent, d.setpoint_percent, d.pressure_bar
        ),
        DisplayState::Tankbil(d) => format!(
            "{:?}  safe: {}  deadman {:4.1} s",
            d.status,
            if d.system_safe {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            },
            d.deadman_timer_s
        ),
    };
    format!("{}{}", body, flags)
}
