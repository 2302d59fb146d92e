mod patch;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use hyfixes_early::{
    ConfigSnapshot, TransformerPipeline, build_invocation, build_sarif, diagnostic_result,
    load_config, transformer_rules,
};
use tracing::Level;

use crate::patch::patch_input;

/// CLI arguments for hyfixes-early execution.
#[derive(Parser, Debug)]
#[command(
    name = "hyfixes-early",
    about = "Apply the curated load-time fixes to JVM class files and JAR files.",
    version
)]
struct Cli {
    /// `.class` or `.jar` file to patch.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Where to write the patched class or jar; `-` for stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Early plugin `config.json`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Where to write the SARIF report; `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ConfigSnapshot::default(),
    };
    init_logging(cli.quiet, config.verbose);

    let started_at = Instant::now();
    let pipeline = TransformerPipeline::from_config(&config);
    let output = patch_input(&cli.input, &pipeline)?;

    if let Some(path) = cli.output.as_deref() {
        let mut writer = output_writer(path)?;
        writer
            .write_all(&output.bytes)
            .context("failed to write patched output")?;
        writer.flush().context("failed to write patched output")?;
    }

    if let Some(path) = report_path(cli.report.as_deref(), cli.output.as_deref()) {
        let results = output.diagnostics.iter().map(diagnostic_result).collect();
        let rules = transformer_rules(&pipeline.registry());
        let sarif = build_sarif(rules, output.artifacts, results, build_invocation());
        let mut writer = output_writer(path)?;
        serde_json::to_writer_pretty(&mut writer, &sarif)
            .context("failed to serialize SARIF output")?;
        writer
            .write_all(b"\n")
            .context("failed to write SARIF output")?;
    }

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} patched={}",
            started_at.elapsed().as_millis(),
            output.class_count,
            output.patched_count
        );
    }

    Ok(())
}

fn init_logging(quiet: bool, verbose: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    // A subscriber may already be installed when run from tests.
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// The report goes to stdout by default unless the patched bytes already do.
fn report_path<'a>(report: Option<&'a Path>, output: Option<&Path>) -> Option<&'a Path> {
    match report {
        Some(path) => Some(path),
        None if output == Some(Path::new("-")) => None,
        None => Some(Path::new("-")),
    }
}

fn output_writer(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cli(input: PathBuf) -> Cli {
        Cli {
            input,
            output: None,
            config: None,
            report: None,
            quiet: true,
            timing: false,
        }
    }

    #[test]
    fn report_defaults_to_stdout_unless_output_uses_it() {
        assert_eq!(Some(Path::new("-")), report_path(None, None));
        assert_eq!(None, report_path(None, Some(Path::new("-"))));
        assert_eq!(
            Some(Path::new("out.sarif")),
            report_path(Some(Path::new("out.sarif")), Some(Path::new("-")))
        );
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");

        let error = run(cli(dir.path().join("absent.jar"))).expect_err("missing input");

        assert!(error.to_string().contains("input not found"));
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input = dir.path().join("Sample.class");
        fs::write(&input, b"irrelevant").expect("write input");
        let config = dir.path().join("config.json");
        fs::write(&config, r#"{"world": {"retryDelayMs": -1}}"#).expect("write config");
        let mut cli = cli(input);
        cli.config = Some(config);

        assert!(run(cli).is_err());
    }
}
