use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use type_input::{EiInjector, Sequencer, TextEncoder};

mod config;

/// Exit status when nothing could be typed at all: the compositor never
/// offered a keyboard, or the input channel broke mid-run.
const EXIT_FATAL: u8 = 1;

/// Virtual keyboard typing tool for Wayland compositors.
///
/// Types the given text through libei. Characters missing from the active
/// keyboard layout are entered with the `Ctrl+Shift+U` Unicode sequence.
#[derive(Parser, Debug)]
#[command(name = "cosmic-ext-type", version, about)]
struct Cli {
    /// Text to type. Multiple arguments are typed back to back.
    #[arg(required = true)]
    text: Vec<String>,

    /// Do not flush the connection after each key press/release.
    #[arg(long)]
    no_flush: bool,

    /// Delay N milliseconds between keys.
    #[arg(short = 'd', long, value_name = "MS")]
    key_delay: Option<u64>,

    /// Hold each key for N milliseconds.
    #[arg(short = 'H', long, value_name = "MS")]
    key_hold: Option<u64>,

    /// Wait at most N milliseconds for the compositor's keyboard.
    #[arg(short = 't', long, value_name = "MS")]
    ready_timeout: Option<u64>,

    /// Path to configuration file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Wait for the keyboard, type the text and return the exit status.
async fn run(cli: Cli) -> Result<u8> {
    let cfg = load_and_merge_config(&cli)?;

    let injector = EiInjector::connect(&cfg.app_name, cfg.ready_timeout())
        .await
        .context("failed to get a virtual keyboard from the compositor")?;

    let timing = cfg.timing();
    tracing::debug!(?timing, "Keyboard ready, typing");

    let text = cli.text;
    let report = tokio::task::spawn_blocking(move || {
        let layout = injector.layout();
        let mut encoder = TextEncoder::new(layout, Sequencer::new(injector, timing));
        encoder.encode(text.as_slice())
    })
    .await
    .context("typing task panicked")?
    .context("failed to inject key events")?;

    if !report.is_success() {
        tracing::warn!(
            failed = report.failures.len(),
            "Some characters could not be typed"
        );
    }
    Ok(report.exit_code())
}

/// Load config from file and apply CLI overrides.
fn load_and_merge_config(cli: &Cli) -> Result<config::TypeConfig> {
    let mut cfg = config::load(cli.config.as_deref())?;

    if cli.no_flush {
        cfg.no_flush = true;
    }
    if let Some(delay) = cli.key_delay {
        cfg.key_delay_ms = delay;
    }
    if let Some(hold) = cli.key_hold {
        cfg.key_hold_ms = hold;
    }
    if let Some(timeout) = cli.ready_timeout {
        cfg.ready_timeout_ms = timeout;
    }

    if cfg.ready_timeout_ms == 0 {
        bail!("ready timeout must be greater than zero");
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["cosmic-ext-type", "--config", "/nonexistent/cosmic-ext-type.toml"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&["--no-flush", "-d", "50", "-H", "5", "hello", "world"]);
        assert_eq!(cli.text, vec!["hello", "world"]);

        let cfg = load_and_merge_config(&cli).unwrap();
        let timing = cfg.timing();
        assert!(timing.no_flush);
        assert_eq!(timing.key_delay, Duration::from_millis(50));
        assert_eq!(timing.key_hold, Duration::from_millis(5));
    }

    #[test]
    fn long_flags_and_timeout() {
        let cli = parse(&["--key-delay", "7", "--key-hold", "3", "-t", "250", "x"]);
        let cfg = load_and_merge_config(&cli).unwrap();
        assert_eq!(cfg.key_delay_ms, 7);
        assert_eq!(cfg.key_hold_ms, 3);
        assert_eq!(cfg.ready_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn text_is_required() {
        let err = Cli::try_parse_from(["cosmic-ext-type", "--no-flush"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn zero_timeout_rejected() {
        let cli = parse(&["-t", "0", "x"]);
        assert!(load_and_merge_config(&cli).is_err());
    }
}
