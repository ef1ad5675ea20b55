use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use backend::{
    ApiConfig, ApiContext, DetectionLoop, FrameSource, LoopConfig, SyntheticDevice,
    SyntheticTracker, duplex, serve,
};
use clap::Parser;
use log::{LevelFilter, info};

/// Detects, tracks and counts objects from a camera feed; serves the counts
/// and a live dashboard over HTTP.
#[derive(Debug, Parser)]
#[command(name = "tracker", version)]
struct Args {
    /// Camera index to use.
    #[arg(short, long, default_value_t = 0)]
    camera: u32,

    /// Instance name, used by the counter registry and `/health`.
    #[arg(short, long, default_value = "cam0")]
    instance: String,

    /// Port the HTTP API listens on.
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Class label to count.
    #[arg(long = "class", default_value = "person")]
    target_class: String,

    /// Origin allowed to read API responses cross-site (repeatable).
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Log only to file, not to the console.
    #[arg(long)]
    file_only_log: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level, args.file_only_log)?;
    info!(
        "starting tracker for instance {} (camera {}, counting '{}')",
        args.instance, args.camera, args.target_class
    );

    let (detection_bus, api_tx, api_rx) = duplex();

    let source = FrameSource::start(Box::new(SyntheticDevice::new()));
    let detection_loop = DetectionLoop::new(
        LoopConfig {
            instance: args.instance.clone(),
            target_class: args.target_class,
        },
        detection_bus,
        Box::new(source),
        Box::new(SyntheticTracker::new()),
    );
    detection_loop.spawn();

    let state = ApiContext::new(
        ApiConfig {
            instance: args.instance,
            allowed_origins: args.allowed_origins,
        },
        api_tx,
    );
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(state, api_rx, addr))
}

fn init_logging(level: LevelFilter, file_only: bool) -> Result<()> {
    log_panics::init();

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(fern::log_file("tracker.log")?);
    if !file_only {
        dispatch = dispatch.chain(std::io::stdout());
    }
    dispatch.apply()?;

    Ok(())
}
