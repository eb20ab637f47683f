use std::path::Path;

use anyhow::{bail, Context, Result};
use ova_builder::{compress, ConversionJob, HostInvoker, JobConfig};

fn usage() -> &'static str {
    "Usage:\n  ova-builder convert <job.toml>\n  ova-builder inspect <image.ova[.gz]>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [cmd, config] if cmd == "convert" => convert(Path::new(config)),
        [cmd, image] if cmd == "inspect" => inspect(Path::new(image)),
        _ => bail!(usage()),
    }
}

fn convert(config_path: &Path) -> Result<()> {
    let config = JobConfig::load(config_path)?;
    let job = ConversionJob::from_config(config)?;
    let artifact = job
        .run(&HostInvoker)
        .with_context(|| format!("converting '{}'", job.source))?;
    println!("{}", artifact.display());
    Ok(())
}

fn inspect(image: &Path) -> Result<()> {
    let compressed = compress::is_gzip(image)?;
    let size = std::fs::metadata(image)
        .with_context(|| format!("stat '{}'", image.display()))?
        .len();
    println!("path: {}", image.display());
    println!("size: {size}");
    println!("gzip: {}", if compressed { "yes" } else { "no" });
    Ok(())
}
