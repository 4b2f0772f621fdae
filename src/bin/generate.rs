use std::env;
use std::fs::{self, File};
use std::io::BufWriter;
use std::process;

use anyhow::{Context, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if !(4..=5).contains(&args.len()) {
        eprintln!("usage: {} <oldfile> <newfile> <patchfile> [blocksize]", args[0]);
        process::exit(1);
    }

    let old = fs::read(&args[1]).with_context(|| format!("cannot read {}", args[1]))?;
    let new = fs::read(&args[2]).with_context(|| format!("cannot read {}", args[2]))?;
    let block_size = match args.get(4) {
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("invalid blocksize {raw:?}"))?
            .max(0) as usize,
        None => 0,
    };

    let file = File::create(&args[3]).with_context(|| format!("cannot create {}", args[3]))?;
    let mut patch = BufWriter::new(file);
    bdelta::generate(&old, &new, &mut patch, block_size)
        .with_context(|| format!("cannot generate {}", args[3]))?;
    Ok(())
}
