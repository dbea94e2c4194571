//! alphafs - open (or create) a volume image and run the command shell on it.
//!
//! Usage:
//!   alphafs --image alpha.img --size 16M       # mount, formatting if needed
//!   alphafs --config alpha.json --format       # always start from an empty volume

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use alphafs::{shell::Shell, AlphaConfig, AlphaError, AlphaFs, FileDisk, MountKind};
use clap::Parser;
use log::{error, info};

#[derive(Parser)]
#[command(name = "alphafs")]
#[command(about = "Interactive shell for alphafs volume images")]
struct Args {
    /// Volume image on the host
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Size of a new image (e.g. 512K, 16M, 1G)
    #[arg(short, long)]
    size: Option<String>,

    /// Block size in bytes
    #[arg(short, long)]
    block_size: Option<u32>,

    /// Volume name used when formatting
    #[arg(short, long)]
    name: Option<String>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Format the image even if it already holds a volume
    #[arg(short, long)]
    format: bool,
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let (num_str, mult) = if s.ends_with('G') || s.ends_with("GB") {
        (s.trim_end_matches("GB").trim_end_matches('G'), 1024 * 1024 * 1024)
    } else if s.ends_with('M') || s.ends_with("MB") {
        (s.trim_end_matches("MB").trim_end_matches('M'), 1024 * 1024)
    } else if s.ends_with('K') || s.ends_with("KB") {
        (s.trim_end_matches("KB").trim_end_matches('K'), 1024)
    } else {
        (s.as_str(), 1)
    };
    num_str.parse::<u64>().ok().map(|n| n * mult)
}

fn load_config(args: &Args) -> Result<AlphaConfig, AlphaError> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read(path).map_err(|e| AlphaError::Config(e.to_string()))?;
            AlphaConfig::from_json(&data)?
        }
        None => AlphaConfig::default(),
    };
    if let Some(image) = &args.image {
        config.image = image.display().to_string();
    }
    if let Some(size) = &args.size {
        config.volume_size = parse_size(size)
            .ok_or_else(|| AlphaError::Config(format!("cannot parse size '{}'", size)))?;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(name) = &args.name {
        config.volume_name = name.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), AlphaError> {
    let config = load_config(&args)?;
    let disk = FileDisk::open(&config.image, config.volume_size, config.block_size)?;
    let fs = if args.format {
        AlphaFs::format(disk, &config.volume_name)?
    } else {
        AlphaFs::open(disk, &config.volume_name)?
    };
    if fs.mount_kind() == MountKind::Formatted {
        println!("Created new volume '{}'", fs.volume_name());
    }

    let mut shell = Shell::new(fs);
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();
    shell
        .run(&mut input, &mut out)
        .map_err(|e| AlphaError::Io(e.to_string()))?;
    out.flush().map_err(|e| AlphaError::Io(e.to_string()))?;

    shell.into_fs().close()?;
    info!("volume {} closed", config.image);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("alphafs: {}", e);
            ExitCode::FAILURE
        }
    }
}
