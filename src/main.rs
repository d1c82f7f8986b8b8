use std::ops::ControlFlow;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use time::{OffsetDateTime, PrimitiveDateTime};

use cms50ew::logging::init_rust_logging;
use cms50ew::{
    Cms50ew, LinkConfig, LiveConfig, LiveStatus, Target, EXPORT_HEADER, EXPORT_HEADER_ABSOLUTE,
};

#[derive(Parser, Debug)]
#[command(name = "cms50ew", about = "Read live data or the stored session from a CMS50EW oximeter")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print live readings until the sample count is reached
    Live {
        #[command(flatten)]
        link: LinkArgs,
        /// Readings to print (0 = until interrupted)
        #[arg(long, default_value_t = 0)]
        samples: usize,
        /// Absent samples tolerated before reporting "Finger out"
        #[arg(long, default_value_t = LiveConfig::default().finger_out_threshold)]
        threshold: u32,
    },
    /// Download the stored session and print it as CSV
    Download {
        #[command(flatten)]
        link: LinkArgs,
        /// Session start as unix seconds; prints wall-clock times instead of offsets
        #[arg(long)]
        absolute: Option<i64>,
    },
}

#[derive(Args, Debug)]
struct LinkArgs {
    /// Serial device path (e.g. /dev/ttyUSB0) or, with -b, a Bluetooth MAC
    device: String,
    /// Treat DEVICE as a Bluetooth MAC address
    #[arg(short, long)]
    bluetooth: bool,
    /// Pairing PIN, if the device asks for one
    #[arg(long)]
    pin: Option<String>,
}

impl LinkArgs {
    fn open(&self) -> Result<Cms50ew> {
        let target = if self.bluetooth {
            Target::Bluetooth(self.device.clone())
        } else {
            Target::Serial(self.device.clone())
        };
        let config = LinkConfig {
            pin: self.pin.clone(),
            ..LinkConfig::default()
        };
        Cms50ew::open(target.clone(), &config).with_context(|| format!("opening {target}"))
    }
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Cmd::Live {
            link,
            samples,
            threshold,
        } => live(&link, samples, threshold),
        Cmd::Download { link, absolute } => download(&link, absolute),
    }
}

fn live(link: &LinkArgs, samples: usize, threshold: u32) -> Result<()> {
    let mut oxi = link.open()?;
    let config = LiveConfig {
        finger_out_threshold: threshold,
        ..LiveConfig::default()
    };

    let mut printed = 0usize;
    let mut last_status = None;
    let record = oxi
        .live(&config, |reading, _| {
            if last_status != Some(reading.status) {
                println!("# {}", reading.status.as_str());
                last_status = Some(reading.status);
            }
            match (reading.status, reading.pulse_bpm, reading.spo2_pct) {
                (LiveStatus::Processing, Some(pulse), Some(spo2)) => {
                    println!("pulse={pulse} bpm spo2={spo2} %")
                }
                _ => println!("pulse=n/a spo2=n/a"),
            }
            printed += 1;
            if samples > 0 && printed >= samples {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .context("live capture")?;

    eprintln!(
        "recorded {} points over {:.0} s",
        record.len(),
        record.duration().as_secs_f64()
    );
    oxi.close()?;
    Ok(())
}

fn download(link: &LinkArgs, absolute: Option<i64>) -> Result<()> {
    let mut oxi = link.open()?;

    let (meta, record) = oxi
        .download_session(|p| {
            eprint!("\rdownloading {}/{}", p.downloaded, p.expected);
            ControlFlow::Continue(())
        })
        .context("downloading stored session")?;
    eprintln!();
    let user = oxi.user().context("reading user")?;
    eprintln!(
        "user={:?} duration={:?} points={}/{}",
        user,
        meta.duration,
        record.len(),
        meta.expected_point_count
    );
    if record.is_empty() {
        bail!("device returned no points");
    }

    match absolute {
        None => {
            println!("{}", EXPORT_HEADER.join(","));
            for row in record.rows() {
                println!("{},{},{},{}", row.time, row.finger, row.pulse_bpm, row.spo2_pct);
            }
        }
        Some(unix) => {
            let start = OffsetDateTime::from_unix_timestamp(unix).context("invalid start time")?;
            let start = PrimitiveDateTime::new(start.date(), start.time());
            println!("{}", EXPORT_HEADER_ABSOLUTE.join(","));
            for row in record.rebased(start) {
                println!("{},{},{},{}", row.time, row.finger, row.pulse_bpm, row.spo2_pct);
            }
        }
    }

    oxi.close()?;
    Ok(())
}
