use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use simplelog::{ConfigBuilder, WriteLogger};
use softglue_daq::{
    sim::{EventGenerator, Feed, SimulatedDevice},
    tui::Console,
    AcquisitionController, Conf, LogReset,
};
use std::{
    fs::File,
    path::PathBuf,
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

#[derive(Parser, Debug)]
#[command(version, about = "SoftGlue digitizer acquisition")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve generated events from a local simulated device
    #[arg(long)]
    simulate: bool,

    /// Acquire for this many seconds without the console, then exit
    #[arg(long, value_name = "SECONDS")]
    headless: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut conf = Conf::load(args.config.as_deref()).context("loading configuration")?;

    let level = LevelFilter::from_str(&conf.debug.log_level).unwrap_or(LevelFilter::Info);
    WriteLogger::init(
        level,
        ConfigBuilder::new().set_time_format_rfc3339().build(),
        File::create(&conf.debug.log_file)
            .with_context(|| format!("creating log file {}", conf.debug.log_file))?,
    )?;

    // Keep the simulator alive for the whole run.
    let _device = if args.simulate {
        let packet_size = conf.device.packet_size;
        let device = SimulatedDevice::spawn(
            packet_size,
            Feed::Generated {
                generator: EventGenerator::new(0x5067, 0.02),
                words_per_request: packet_size,
            },
        )?;
        conf.device.address = device.addr().to_string();
        Some(device)
    } else {
        None
    };

    let controller = AcquisitionController::new(conf, Box::new(LogReset))?;

    match args.headless {
        Some(seconds) => headless(controller, Duration::from_secs(seconds)),
        None => {
            let mut terminal = ratatui::init();
            let mut console = Console::new(controller);
            let result = console.run(&mut terminal);
            ratatui::restore();
            result
        }
    }
}

fn headless(mut controller: AcquisitionController, duration: Duration) -> Result<()> {
    controller.start()?;
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if let Some(result) = controller.reap() {
            let report = result?;
            println!("Session ended early: {} events", report.events_written);
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    let report = controller.stop()?;
    info!("Headless session done: {report:?}");
    println!(
        "Wrote {} events ({} packets, {} long events) to {}",
        report.events_written,
        report.stats.packets,
        report.stats.long_events,
        report.file.display()
    );
    Ok(())
}
