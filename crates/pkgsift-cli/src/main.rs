//! pkgsift - inspect installer packages

use anyhow::Result;
use clap::Parser;
use pkgsift_core::{extract_path, extract_url, extract_with_contents, InstallerMetadata};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pkgsift")]
#[command(author, version, about = "Inspect installer packages without installing them")]
struct Cli {
    /// Package file path, or an http(s) URL to download
    source: String,

    /// Emit metadata as JSON
    #[arg(long)]
    json: bool,

    /// List the payload's unpacked file names (local files only)
    #[arg(long, conflicts_with = "json")]
    files: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let remote = cli.source.starts_with("http://") || cli.source.starts_with("https://");

    if cli.files {
        if remote {
            anyhow::bail!("--files requires a local package file");
        }
        let file = std::fs::File::open(&cli.source)?;
        let (meta, descriptor) = extract_with_contents(file).await?;
        print_summary(&meta);
        println!();
        println!(
            "Payload `{}` ({} files, {} bytes):",
            descriptor.path,
            descriptor.files.len(),
            descriptor.size
        );
        for (name, data) in &descriptor.files {
            println!("  {:>10}  {name}", data.len());
        }
        return Ok(());
    }

    let meta = if remote {
        extract_url(&cli.source).await?
    } else {
        extract_path(&cli.source).await?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&meta)?);
    } else {
        print_summary(&meta);
    }
    Ok(())
}

fn print_summary(meta: &InstallerMetadata) {
    println!("{} {}", meta.bundle_id, meta.version);
    println!("  install location: {}", meta.install_location);
    if let Some(min_os) = &meta.min_os_version {
        println!("  minimum OS: {min_os}");
    }
    println!("  installed size: {} bytes", meta.size);
    if !meta.package_ids.is_empty() {
        println!("  packages: {}", meta.package_ids.join(", "));
    }
    for bundle in &meta.included_bundles {
        println!("  bundle: {} {} ({})", bundle.bundle_id, bundle.version, bundle.path);
    }
    if !meta.install_paths.is_empty() {
        println!("  paths:");
        for path in &meta.install_paths {
            println!("    {path}");
        }
    }
}
