//! sectorsift - Pull files out of disc images and split movie streams
//!
//! This tool lists and extracts the ISO9660 and XDVDFS volumes found in
//! disc images (cooked or raw), and demultiplexes MPEG program streams into
//! one file per elementary stream.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sectorsift_core::{
    scan_volumes, CancelFlag, DemuxOptions, Demuxer, Extractor, Mpeg2, SectorReader, SonyPam,
    StreamFormat, SubHeaderPolicy, UnknownBlockPolicy, Volume,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Extract disc image volumes and demultiplex program streams
#[derive(Parser, Debug)]
#[command(name = "sectorsift")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the volumes and files in disc images
    List(ListArgs),
    /// Extract every volume of disc images to a directory
    Extract(ExtractArgs),
    /// Split program streams into elementary stream files
    Demux(DemuxArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Disc images, or directories to search for them
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Disc images, or directories to search for them
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Output directory; each image extracts into a folder named after it
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct DemuxArgs {
    /// Stream files, or directories to search for them
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Stream layout
    #[arg(long, value_enum, default_value = "sony-pam")]
    format: StreamKind,

    /// Skip audio streams
    #[arg(long)]
    no_audio: bool,

    /// Skip video streams
    #[arg(long)]
    no_video: bool,

    /// Wrap audio streams in a playable container header where supported
    #[arg(long)]
    add_header: bool,

    /// Fail on unrecognized start codes instead of skipping junk bytes
    #[arg(long)]
    strict: bool,

    /// Fail on unrecognized audio sub-headers instead of copying them
    #[arg(long)]
    reject_unknown_subheaders: bool,

    /// Output directory (defaults to next to each input)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Supported program stream layouts
#[derive(Debug, Clone, Copy, ValueEnum)]
enum StreamKind {
    /// Sony PSP movie streams (PAM/PMF)
    SonyPam,
    /// Plain MPEG-1/MPEG-2 program streams
    Mpeg2,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    // Nothing in the CLI raises this; library callers cancel from another thread
    let cancel = CancelFlag::new();

    match &cli.command {
        Command::List(args) => for_each_input(&args.paths, list_image),
        Command::Extract(args) => {
            for_each_input(&args.paths, |path| extract_image(path, &args.output, &cancel))
        }
        Command::Demux(args) => demux_inputs(args, &cancel),
    }
}

/// Runs `action` on every input file, continuing past failures
fn for_each_input(paths: &[PathBuf], mut action: impl FnMut(&Path) -> Result<()>) -> Result<()> {
    let inputs = collect_inputs(paths)?;
    if inputs.is_empty() {
        bail!("No input files found");
    }

    let mut failed = 0;
    for input in &inputs {
        debug!("Processing {}", input.display());
        if let Err(e) = action(input) {
            // Log error but continue with other files
            error!("{}: {:#}", input.display(), e);
            failed += 1;
        }
    }

    info!("Processed {} inputs ({} failed)", inputs.len(), failed);
    if failed > 0 {
        bail!("{} of {} inputs failed", failed, inputs.len());
    }
    Ok(())
}

/// Expands directories into the files below them
fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();

    for path in paths {
        if path.is_file() {
            inputs.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("Input path does not exist: {}", path.display());
        }

        info!("Scanning directory: {}", path.display());
        for entry in WalkDir::new(path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }

            // Skip hidden files
            if entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false)
            {
                trace!("Skipping hidden file: {}", entry_path.display());
                continue;
            }

            inputs.push(entry_path.to_path_buf());
        }
    }

    Ok(inputs)
}

fn open_image(path: &Path) -> Result<(SectorReader<File>, Vec<Volume>)> {
    let mut reader = SectorReader::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?;
    let volumes = scan_volumes(&mut reader)
        .with_context(|| format!("Failed to scan image: {}", path.display()))?;
    Ok((reader, volumes))
}

/// Print the volume catalog and file tree of one image
fn list_image(path: &Path) -> Result<()> {
    let (reader, volumes) = open_image(path)?;

    println!(
        "{} ({} sector layout)",
        path.display(),
        if reader.is_raw() { "raw" } else { "cooked" }
    );
    if volumes.is_empty() {
        println!("  no volumes found");
    }

    for (index, volume) in volumes.iter().enumerate() {
        println!(
            "  [{}] {} '{}' at 0x{:X}, {} sectors, {} files{}",
            index,
            volume.format().as_str(),
            volume.label(),
            volume.base_offset(),
            volume.space_size(),
            volume.file_count(),
            if volume.is_dummy() { " (placeholder)" } else { "" }
        );
        for (relative, file) in volume.root().walk() {
            println!(
                "      {} ({} bytes at 0x{:X})",
                relative.display(),
                file.length,
                file.offset
            );
        }
    }

    Ok(())
}

/// Destination for volume `index` of an image with `count` volumes
fn volume_destination(output: &Path, image: &Path, index: usize, count: usize) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let base = output.join(stem);

    if count > 1 {
        base.join(format!("volume_{:02}", index))
    } else {
        base
    }
}

/// Extract every non-placeholder volume of one image
fn extract_image(path: &Path, output: &Path, cancel: &CancelFlag) -> Result<()> {
    let (mut reader, volumes) = open_image(path)?;
    if volumes.is_empty() {
        bail!("No volumes found in {}", path.display());
    }

    let mut extractor = Extractor::new(&mut reader, cancel)
        .on_file_written(|written| trace!("Wrote {}", written.display()));

    let mut errors = 0;
    for (index, volume) in volumes.iter().enumerate() {
        if volume.is_dummy() {
            debug!("Skipping placeholder volume {}", index);
            continue;
        }

        let destination = volume_destination(output, path, index, volumes.len());
        let report = extractor
            .extract_volume(volume, &destination)
            .with_context(|| format!("Failed to extract volume {}", index))?;

        println!(
            "Extracted {} files ({} bytes) to {}",
            report.files_written,
            report.bytes_written,
            destination.display()
        );
        for e in &report.errors {
            warn!("{}", e);
        }
        errors += report.errors.len();

        if report.outcome.is_cancelled() {
            warn!("Extraction cancelled");
            break;
        }
    }

    if errors > 0 {
        bail!("{} entries could not be extracted", errors);
    }
    Ok(())
}

fn demux_inputs(args: &DemuxArgs, cancel: &CancelFlag) -> Result<()> {
    let mut options = DemuxOptions::new()
        .extract_audio(!args.no_audio)
        .extract_video(!args.no_video)
        .add_header(args.add_header);
    if args.strict {
        options = options.unknown_block_policy(UnknownBlockPolicy::Fail);
    }
    if let Some(output) = &args.output {
        options = options.output_dir(output);
    }

    match args.format {
        StreamKind::SonyPam => {
            let policy = if args.reject_unknown_subheaders {
                SubHeaderPolicy::Reject
            } else {
                SubHeaderPolicy::TreatAsEmpty
            };
            let demuxer = Demuxer::with_options(SonyPam::new().sub_header_policy(policy), options);
            for_each_input(&args.paths, |path| demux_stream(&demuxer, path, cancel))
        }
        StreamKind::Mpeg2 => {
            if args.reject_unknown_subheaders {
                warn!("--reject-unknown-subheaders has no effect on plain MPEG streams");
            }
            let demuxer = Demuxer::with_options(Mpeg2::new(), options);
            for_each_input(&args.paths, |path| demux_stream(&demuxer, path, cancel))
        }
    }
}

fn demux_stream<F: StreamFormat>(demuxer: &Demuxer<F>, path: &Path, cancel: &CancelFlag) -> Result<()> {
    let report = demuxer
        .demux_file(path, cancel)
        .with_context(|| format!("Failed to demultiplex: {}", path.display()))?;

    if report.outputs.is_empty() {
        info!("No streams found in {}", path.display());
    }
    for output in &report.outputs {
        println!("Wrote {}", output.display());
    }
    if report.skipped_bytes > 0 {
        warn!(
            "Skipped {} unrecognized bytes in {}",
            report.skipped_bytes,
            path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_inputs_walks_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("disc2");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(temp_dir.path().join("a.iso"), b"a").unwrap();
        std::fs::write(nested.join("b.bin"), b"b").unwrap();
        std::fs::write(temp_dir.path().join(".hidden"), b"h").unwrap();

        let inputs = collect_inputs(&[temp_dir.path().to_path_buf()]).unwrap();
        assert_eq!(
            inputs,
            vec![temp_dir.path().join("a.iso"), nested.join("b.bin")]
        );

        assert!(collect_inputs(&[temp_dir.path().join("missing.iso")]).is_err());
    }

    #[test]
    fn test_volume_destination() {
        let out = Path::new("/out");
        let image = Path::new("/discs/game.iso");
        assert_eq!(volume_destination(out, image, 0, 1), PathBuf::from("/out/game"));
        assert_eq!(
            volume_destination(out, image, 1, 2),
            PathBuf::from("/out/game/volume_01")
        );
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
