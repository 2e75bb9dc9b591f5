use std::{
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;
use modpack::{BundlerOptions, LoaderOptions, bundle};

#[derive(Parser, Debug)]
#[command(name = "modpack", version, about = "Bundle a package and its mapped dependencies")]
struct Cli {
    /// Package directory to bundle
    package: PathBuf,

    /// Existing directory the bundle is written into
    dist: PathBuf,

    /// Seed for package namespace ids (random per run when omitted)
    #[arg(long)]
    seed: Option<String>,

    /// Loader runtime to wrap the primary bundle with
    #[arg(long, value_name = "PATH")]
    loader: Option<PathBuf>,

    /// URL prefix the loader requests the bundle from
    #[arg(long, requires = "loader")]
    url_prefix: Option<String>,

    /// Write the build report as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let options = BundlerOptions {
        package_id_hash_seed: cli.seed,
        loader: cli.loader.map(|runtime_path| LoaderOptions {
            runtime_path,
            bundle_url_prefix: cli.url_prefix,
        }),
        ..BundlerOptions::default()
    };

    let build = bundle(&cli.package, &cli.dist, options)
        .with_context(|| format!("failed to bundle {}", cli.package.display()))?;
    info!(
        "Wrote {} ({} modules, {} dynamic bundles)",
        build.bundle_report.main_bundle.display(),
        build.bundle_report.modules.len(),
        build.dynamic_bundles.len()
    );

    if let Some(report_path) = cli.report {
        let file = std::fs::File::create(&report_path)
            .with_context(|| format!("failed to create {}", report_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &build)
            .with_context(|| format!("failed to write report to {}", report_path.display()))?;
        writer.flush()?;
    }
    Ok(())
}
