use std::path::PathBuf;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, bail},
};
use ftminer_fpga::{Bitstream, Fpga};
use ftminer_io::{
    Chain, Config, Controller, Hex, Link, PinAssignment, Progress, Select, Topology, devices,
    ft232r::{self, Ft232r},
};
use tracing::info;

use crate::cli_helpers::{ChainArg, PinsArg, UsbAddr};

mod cli_helpers;

#[derive(clap::Parser)]
struct Args {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Args)]
struct GlobalOpts {
    #[arg(
        long,
        default_value_t = UsbAddr { vid: ft232r::VID, pid: ft232r::PID },
        global = true,
    )]
    usb: UsbAddr,

    /// Which of the matching bridges to open
    #[arg(long, default_value_t = 0, global = true)]
    index: usize,

    /// JTAG chain: 0, 1 or both
    #[arg(long, default_value = "0", global = true)]
    chain: ChainArg,

    /// tck,tms,tdi,tdo of chain 0, then chain 1
    #[arg(long, global = true)]
    pins: Option<PinsArg>,

    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress_bar: bool,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// List the devices on each chain and the firmware they run
    Info,
    Program(Program),
    /// Detect the chain over and over, checking it stays the same
    StressTest(StressTest),
    Sleep,
    Wake,
}

#[derive(clap::Args)]
struct Program {
    input_file: PathBuf,
}

#[derive(clap::Args)]
struct StressTest {
    #[arg(default_value_t = 100)]
    count: usize,
}

fn main() -> Result<()> {
    init_logging()?;
    let Args { global, command } = Args::parse();
    smol::block_on(run(global, command))
}

fn setup_progress_bar() -> indicatif::ProgressBar {
    let template =
        "{spinner:.green} {elapsed:>3}/{duration:>3} {bar} {bytes}/{total_bytes} ({bytes_per_sec})";
    let style = indicatif::ProgressStyle::with_template(template).unwrap();
    let pb = indicatif::ProgressBar::new(0)
        .with_finish(indicatif::ProgressFinish::Abandon)
        .with_style(style);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

async fn run(global: GlobalOpts, command: CliCommand) -> Result<()> {
    let pins = global.pins.map_or(PinAssignment::X6500, |p| p.0);
    let mut config = Config::default();
    if let Some(baud) = global.baud {
        config.baud_rate = baud;
    }

    let UsbAddr { vid, pid } = global.usb;
    let transport = Ft232r::open(vid, pid, global.index)
        .await
        .wrap_err("opening the bridge")?;
    let mut link = Link::open(transport, &pins, config).await?;
    info!(usb = %global.usb, index = global.index, "bridge open");

    let r = match command {
        CliCommand::Info => info(&mut link, &pins, global.chain).await,
        CliCommand::Program(args) => {
            let pb = (!global.no_progress_bar).then(setup_progress_bar);
            program(&mut link, &pins, global.chain, args, pb.as_ref()).await
        }
        CliCommand::StressTest(args) => {
            for chain in global.chain.chains() {
                let mut jtag = controller(&pins, Select::Single(chain));
                let count = jtag.stress_test(&mut link, args.count).await?;
                println!("chain {chain}: {count} devices, stable over {} runs", args.count);
            }
            Ok(())
        }
        CliCommand::Sleep => sleep_or_wake(&mut link, &pins, global.chain, true).await,
        CliCommand::Wake => sleep_or_wake(&mut link, &pins, global.chain, false).await,
    };
    link.close().await?;
    r
}

fn controller(pins: &PinAssignment, select: Select) -> Controller {
    Controller::new(pins.pins(select), devices::table())
}

fn is_fpga(device: &ftminer_io::Device) -> bool {
    device.info.name.starts_with("XC6S")
}

async fn info(link: &mut Link<Ft232r>, pins: &PinAssignment, chain: ChainArg) -> Result<()> {
    for chain in chain.chains() {
        let mut jtag = controller(pins, Select::Single(chain));
        let topology = jtag.detect(link).await?.clone();
        println!("chain {chain}:");
        for (part, device) in topology.devices().iter().enumerate() {
            let fields = devices::decode(device.idcode);
            print!(
                "{part:>4}: {} {:<12} irlen {:>2} rev {}",
                Hex(device.idcode),
                device.info.name,
                device.irlen(),
                fields.revision,
            );
            if is_fpga(device) {
                let fpga = Fpga::attach(link, jtag, part).await?;
                print!(", firmware {}", fpga.framing());
                jtag = fpga.into_controller();
            }
            println!();
        }
    }
    Ok(())
}

async fn sleep_or_wake(
    link: &mut Link<Ft232r>,
    pins: &PinAssignment,
    chain: ChainArg,
    sleep: bool,
) -> Result<()> {
    for chain in chain.chains() {
        let mut jtag = controller(pins, Select::Single(chain));
        let topology = jtag.detect(link).await?.clone();
        for (part, device) in topology.devices().iter().enumerate() {
            if !is_fpga(device) {
                continue;
            }
            let mut fpga = Fpga::attach(link, jtag, part).await?;
            if sleep {
                fpga.sleep(link).await?;
            } else {
                fpga.wake(link).await?;
            }
            jtag = fpga.into_controller();
        }
    }
    Ok(())
}

/// Both chains are programmed at once, so they have to look the same.
async fn both_chains(link: &mut Link<Ft232r>, pins: &PinAssignment) -> Result<Controller> {
    let mut topologies = Vec::<Topology>::new();
    for chain in [Chain::Zero, Chain::One] {
        let mut jtag = controller(pins, Select::Single(chain));
        topologies.push(jtag.detect(link).await?.clone());
    }
    if topologies[0] != topologies[1] {
        bail!("chains differ, program them one at a time");
    }
    let topology = topologies.swap_remove(0);
    Ok(Controller::with_topology(
        pins.pins(Select::Both),
        devices::table(),
        topology,
    ))
}

async fn program(
    link: &mut Link<Ft232r>,
    pins: &PinAssignment,
    chain: ChainArg,
    args: Program,
    pb: Option<&indicatif::ProgressBar>,
) -> Result<()> {
    let file = smol::fs::read(&args.input_file)
        .await
        .wrap_err_with(|| format!("reading {}", args.input_file.display()))?;
    let bitstream = Bitstream::parse(&file)?;
    println!(
        "{} for {} ({} {}), {} bytes",
        bitstream.design_name,
        bitstream.part_name,
        bitstream.date,
        bitstream.time,
        bitstream.data.len()
    );

    let mut jtag = match chain.0 {
        Select::Both => both_chains(link, pins).await?,
        select => {
            let mut jtag = controller(pins, select);
            jtag.detect(link).await?;
            jtag
        }
    };
    if let Some(pb) = pb {
        pb.set_length(bitstream.data.len() as _);
    }
    let progress = |p: Progress| {
        if let Some(pb) = pb {
            pb.set_position(p.written as _);
        }
    };
    ftminer_fpga::program(link, &mut jtag, &bitstream, progress).await?;
    info!(design = %bitstream.design_name, %chain, "programmed");
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}
