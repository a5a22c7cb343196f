//! Extract command - unpack a tar, tar.gz, tar.xz or zip archive.

use std::path::PathBuf;

use indicatif::HumanBytes;
use scenesync::archive::extract_file;

use crate::error::CliError;

/// Arguments for the extract command.
#[derive(Debug)]
pub struct ExtractArgs {
    pub archive: PathBuf,
    pub dest: PathBuf,
    pub strip_top: bool,
}

/// Run the extract command.
pub fn run(args: ExtractArgs) -> Result<(), CliError> {
    if !args.archive.is_file() {
        return Err(CliError::Config(format!(
            "Archive not found: {}",
            args.archive.display()
        )));
    }
    std::fs::create_dir_all(&args.dest)?;

    let summary = extract_file(&args.archive, &args.dest, args.strip_top)?;
    let bytes: u64 = summary.files.iter().map(|f| f.size).sum();

    println!(
        "Extracted {} file(s), {} into {}",
        summary.files.len(),
        HumanBytes(bytes),
        args.dest.display()
    );
    if !summary.skipped.is_empty() {
        println!("Skipped {} entr(ies):", summary.skipped.len());
        for path in &summary.skipped {
            println!("  {}", path);
        }
    }
    Ok(())
}
