use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::Path;
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
    if args.len() != 4 {
        eprintln!("usage: {} <oldfile> <newfile|tmpdir> <patchfile>", args[0]);
        process::exit(1);
    }

    let mut patch = BufReader::new(
        File::open(&args[3]).with_context(|| format!("cannot open {}", args[3]))?,
    );

    let dest = Path::new(&args[2]);
    if dest.is_dir() {
        // block-cache mode: the reference is patched in place, one verified block at a time
        let mut old = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&args[1])
            .with_context(|| format!("cannot open {}", args[1]))?;
        bdelta::apply_cached(&mut old, dest, &mut patch)
            .with_context(|| format!("cannot apply {}", args[3]))?;
    } else {
        let mut old =
            File::open(&args[1]).with_context(|| format!("cannot open {}", args[1]))?;
        let mut new = BufWriter::new(
            File::create(dest).with_context(|| format!("cannot create {}", args[2]))?,
        );
        bdelta::apply(&mut old, &mut new, &mut patch)
            .with_context(|| format!("cannot apply {}", args[3]))?;
    }
    Ok(())
}
