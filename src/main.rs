use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;

use icolink::logging::init_rust_logging;
use icolink::{
    bandwidth, expected_sample_rate, statistics_raw, AdcConfig, Channel, DataSetLayout, Session,
    StreamingConfig, STH1,
};

#[derive(Parser, Debug)]
#[command(
    name = "icolink",
    about = "Stream data from a sensor node and print its statistics"
)]
struct Args {
    /// SocketCAN interface (e.g. can0)
    #[arg(long, default_value = "can0", conflicts_with = "slcan")]
    interface: String,
    /// Serial port of an SLCAN adapter instead of SocketCAN
    #[arg(long)]
    slcan: Option<String>,
    /// CAN bitrate of the SLCAN adapter
    #[arg(long, default_value_t = 1_000_000)]
    bitrate: u32,
    /// Target node number
    #[arg(long, default_value_t = STH1)]
    node: u8,
    /// Streaming duration in seconds
    #[arg(long, default_value_t = 1.0)]
    seconds: f64,
    /// Enabled axes, e.g. "100" for the first axis only
    #[arg(long, default_value = "100")]
    axes: String,
    /// Stream voltage instead of acceleration
    #[arg(long)]
    voltage: bool,
    /// Use the interleaved three-channel data set layout
    #[arg(long)]
    interleaved: bool,
    #[arg(long, default_value_t = 2)]
    prescaler: u8,
    #[arg(long, default_value_t = 8)]
    acquisition_time: u16,
    #[arg(long, default_value_t = 64)]
    oversampling: u16,
    /// ADC reference voltage in millivolts
    #[arg(long, default_value_t = 3300)]
    reference_mv: u16,
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn parse_axes(axes: &str) -> Result<[bool; 3]> {
    let bits: Vec<bool> = axes.chars().map(|c| c == '1').collect();
    if bits.len() != 3 || !axes.chars().all(|c| c == '0' || c == '1') {
        bail!("axes must be three 0/1 digits, got {axes:?}");
    }
    if !bits.contains(&true) {
        bail!("at least one axis must be enabled");
    }
    Ok([bits[0], bits[1], bits[2]])
}

fn open(args: &Args) -> Result<Session> {
    let session = match &args.slcan {
        Some(port) => Session::open_slcan(port, args.bitrate)
            .with_context(|| format!("opening SLCAN adapter {port}"))?,
        #[cfg(target_os = "linux")]
        None => Session::open_socketcan(&args.interface)
            .with_context(|| format!("opening SocketCAN interface {}", args.interface))?,
        #[cfg(not(target_os = "linux"))]
        None => bail!("SocketCAN is only available on Linux, use --slcan"),
    };
    session.set_receiver(args.node);
    Ok(session)
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = StreamingConfig {
        channel: if args.voltage {
            Channel::Voltage
        } else {
            Channel::Acceleration
        },
        axes: parse_axes(&args.axes)?,
        layout: if args.interleaved {
            DataSetLayout::Interleaved3
        } else {
            DataSetLayout::Single
        },
        adc: AdcConfig {
            prescaler: args.prescaler,
            acquisition_time: args.acquisition_time,
            oversampling: args.oversampling,
            reference_mv: args.reference_mv,
        },
    };
    config.adc.validate()?;

    let mut session = open(&args)?;

    let version = session
        .firmware_version(args.node)
        .context("reading firmware version")?;
    println!("Node {} firmware {version}", args.node);

    session
        .set_adc_config(args.node, &config.adc)
        .context("applying ADC configuration")?;
    let expected = expected_sample_rate(&config.adc);
    let (can_bps, radio_bps) = bandwidth(&config.adc, config.enabled_axes());
    println!(
        "Expecting {expected:.1} Hz per axis ({:.0} kbit/s CAN, {:.0} kbit/s radio)",
        can_bps / 1000.0,
        radio_bps / 1000.0
    );

    session.reset()?;
    let started = Instant::now();
    let start = session.start_stream(&config).context("starting stream")?;
    thread::sleep(Duration::from_secs_f64(args.seconds));
    let end = session.stop_stream(&config).context("stopping stream")?;
    let elapsed = started.elapsed().as_secs_f64();

    let samples = session.collect_samples(&config, start..end, true)?;
    println!(
        "Collected {} samples from log entries {start}..{end}, {} frames lost",
        samples.len(),
        samples.sequence_gaps()
    );

    for (axis, values) in samples.axes.iter().enumerate() {
        let Some(stats) = statistics_raw(values) else {
            continue;
        };
        println!(
            "Axis {}: n={} mean={:.1} std={:.2} min={} max={} iqr={:.1} snr={:.1} dB, {:.1} Hz observed",
            axis + 1,
            stats.count,
            stats.mean,
            stats.std_dev,
            stats.min,
            stats.max,
            stats.interquartile_range,
            stats.snr_db,
            stats.count as f64 / elapsed
        );
    }

    session.close();
    Ok(())
}
