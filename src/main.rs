//! benchcan command line
//!
//! Usage:
//!   benchcan run --variant tail --interface socketcan --channel can0
//!   benchcan run --variant pdm --interface replay --channel bench.log -k brake
//!   benchcan decode --variant tail candump.log
//!   benchcan catalog --variant pdm

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use benchcan::bus::{CanBus, StdDelay};
use benchcan::can_decoder::{self, InboundMessage};
use benchcan::canlog_reader::{CanLogParser, ReplayBus};
use benchcan::canlog_writer::{CanLogWriter, CaptureBus};
use benchcan::catalog::{Catalog, FieldConstraint, ModuleVariant};
use benchcan::config::SessionConfig;
use benchcan::messages::SignOn;
use benchcan::power::ManualPower;
use benchcan::scenario;
use benchcan::session::Session;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(
    name = "benchcan",
    about = "Hardware-in-the-loop tests for CAN body modules"
)]
struct Args {
    /// Debug logging, including every CAN frame sent and received
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Power-cycle the module and run its test suite
    Run(RunArgs),
    /// Decode every frame of a candump log
    Decode {
        #[arg(long, value_enum, default_value_t = Variant::Tail)]
        variant: Variant,
        log: PathBuf,
    },
    /// List the message definitions of a module variant
    Catalog {
        #[arg(long, value_enum, default_value_t = Variant::Tail)]
        variant: Variant,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, value_enum, default_value_t = Variant::Tail)]
    variant: Variant,

    #[arg(short, long, value_enum, default_value_t = Interface::Socketcan)]
    interface: Interface,

    /// CAN device name, or the log file to replay
    #[arg(short, long, default_value = "can0")]
    channel: String,

    /// Expected bus bitrate; the interface itself is configured outside benchcan
    #[arg(short, long, default_value_t = 500_000)]
    bitrate: u32,

    /// Only run tests whose name contains this string
    #[arg(short = 'k', long)]
    test_name_pattern: Option<String>,

    /// Session timing overrides (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Record all bus traffic to a candump log
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Additional DBC files merged into the catalog
    #[arg(long)]
    dbc: Vec<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Variant {
    Tail,
    TailFuel,
    Pdm,
}

impl From<Variant> for ModuleVariant {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::Tail => ModuleVariant::Tail,
            Variant::TailFuel => ModuleVariant::TailFuel,
            Variant::Pdm => ModuleVariant::Pdm,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Interface {
    Socketcan,
    Replay,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Run(run_args) => run(run_args),
        Command::Decode { variant, log } => decode_log(variant.into(), &log),
        Command::Catalog { variant } => print_catalog(variant.into()),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let variant = ModuleVariant::from(args.variant);
    let mut catalog = Catalog::for_variant(variant)?;
    catalog.extend_from_files(&args.dbc)?;
    let config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    let mut bus = open_bus(&args)?;
    if let Some(path) = &args.capture {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        info!("Capturing traffic to {:?}", path);
        let log = CanLogWriter::new(BufWriter::new(file), &args.channel);
        bus = Box::new(CaptureBus::new(bus, log));
    }

    let tests = scenario::suite(variant)?;
    let mut session = Session::new(catalog, bus, ManualPower::default(), StdDelay, config)?;
    let report = scenario::run_suite(&mut session, &tests, args.test_name_pattern.as_deref());
    println!("{report}");
    if !report.is_success() {
        bail!("{} of {} tests failed", report.failed(), report.results.len());
    }
    Ok(())
}

fn open_bus(args: &RunArgs) -> Result<Box<dyn CanBus>> {
    match args.interface {
        Interface::Replay => {
            let path = Path::new(&args.channel);
            let bus = ReplayBus::from_file(path)
                .with_context(|| format!("opening replay log {}", path.display()))?;
            info!("Replaying {} frames from {:?}", bus.remaining(), path);
            Ok(Box::new(bus))
        }
        Interface::Socketcan => {
            info!(bitrate = args.bitrate, "opening {}", args.channel);
            open_socketcan(&args.channel)
        }
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn open_socketcan(channel: &str) -> Result<Box<dyn CanBus>> {
    let bus = benchcan::bus::SocketCanBus::open(channel)
        .with_context(|| format!("opening CAN interface {channel}"))?;
    Ok(Box::new(bus))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn open_socketcan(_channel: &str) -> Result<Box<dyn CanBus>> {
    bail!("built without SocketCAN support; rebuild with --features socketcan or use --interface replay")
}

fn decode_log(variant: ModuleVariant, log: &Path) -> Result<()> {
    let catalog = Catalog::for_variant(variant)?;
    let parser =
        CanLogParser::from_file(log).with_context(|| format!("opening {}", log.display()))?;
    for logged in parser {
        let frame = logged.frame;
        let text = match can_decoder::decode_any(&catalog, &frame) {
            None => "unknown".to_owned(),
            Some(Ok(message)) => describe(&message),
            Some(Err(err)) => format!("invalid: {err}"),
        };
        println!("({:.6}) {:<24} {text}", logged.timestamp, frame.to_string());
    }
    Ok(())
}

/// One-line summary: fields that are not fixed, then the bit-fields that are set.
fn describe(message: &InboundMessage) -> String {
    if let Ok(sign_on) = SignOn::try_from(message) {
        return format!("{}: {sign_on}", message.name());
    }
    let definition = message.definition();
    let mut parts = vec![message.name().to_owned()];
    for (spec, value) in definition.fields().iter().zip(message.values()) {
        if spec.constraint == FieldConstraint::Free {
            parts.push(format!("{}={value}", spec.name));
        }
    }
    let set: Vec<&str> = message
        .flags()
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();
    if !set.is_empty() {
        parts.push(format!("[{}]", set.join(" ")));
    }
    parts.join(" ")
}

fn print_catalog(variant: ModuleVariant) -> Result<()> {
    let catalog = Catalog::for_variant(variant)?;
    println!("{variant}:");
    for definition in catalog.definitions() {
        let format = if definition.is_extended() { "extended" } else { "standard" };
        println!(
            "  {} {:#x} ({format}, {} bytes)",
            definition.name(),
            definition.id(),
            definition.payload_len()
        );
        for spec in definition.fields() {
            let sign = if spec.signed { "i" } else { "u" };
            let constraint = match spec.constraint {
                FieldConstraint::Free => String::new(),
                FieldConstraint::Fixed(value) => format!(" = {value:#x}"),
            };
            println!(
                "    [{}] {} {sign}{}{constraint}",
                spec.offset,
                spec.name,
                spec.width * 8
            );
        }
        for (name, bit) in definition.bits() {
            let owner = &definition.fields()[bit.field].name;
            println!("    {name}: {owner} bit {}", bit.bit);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let args = Args::try_parse_from(["benchcan", "run"]).unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.bitrate, 500_000);
        assert_eq!(run.channel, "can0");
        assert_eq!(run.interface, Interface::Socketcan);
        assert!(run.dbc.is_empty());
    }
}
