//! tinycom CLI - a small line-based serial terminal.
//!
//! ## Features
//!
//! - Interactive line terminal with selectable line endings and hex input
//! - Optional ANSI escape stripping, hex display and local echo
//! - Send history with re-send
//! - Interactive serial port selection
//! - Persistent settings (TOML) and environment variable support
//! - Shell completion generation

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use tinycom::{DataBits, LineEnding, Parity, StopBits};

mod commands;
mod config;
mod serial;

use config::Config;

/// Exit code for a cancelled prompt (128 + SIGINT).
const EXIT_CANCELLED: u8 = 130;

/// Set by the Ctrl-C handler, polled by long-running loops.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether Ctrl-C was pressed since the flag was last cleared.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the Ctrl-C flag once the interruption has been handled.
pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Failure classes that map to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled a prompt (exit 130).
    #[error("{0}")]
    Cancelled(String),
    /// The serial port could not be used (exit 3).
    #[error("{0}")]
    Port(String),
}

/// tinycom - a small line-based serial terminal.
///
/// Environment variables:
///   TINYCOM_PORT              - Default serial port
///   TINYCOM_BAUD              - Default baud rate (default: 115200)
///   TINYCOM_ENDING            - Default line ending (lf, cr, crlf, lfcr, none, hex)
///   TINYCOM_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser, Debug)]
#[command(name = "tinycom")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (prompted for if not specified).
    #[arg(short, long, global = true, env = "TINYCOM_PORT")]
    port: Option<String>,

    /// Baud rate (default: 115200).
    #[arg(short, long, global = true, env = "TINYCOM_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress status lines and informational logs).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "TINYCOM_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Open an interactive line terminal on a serial port.
    Terminal(TerminalArgs),

    /// List serial ports that can be opened.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Options of the `terminal` command.
#[derive(Args, Debug, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct TerminalArgs {
    /// Data bits (5, 6, 7, 8).
    #[arg(long, value_name = "BITS")]
    data_bits: Option<DataBits>,

    /// Parity (none, even, odd, mark, space).
    #[arg(long)]
    parity: Option<Parity>,

    /// Stop bits (1, 1.5, 2).
    #[arg(long, value_name = "BITS")]
    stop_bits: Option<StopBits>,

    /// Enable XON/XOFF software flow control.
    #[arg(long, overrides_with = "no_xonxoff")]
    xonxoff: bool,

    /// Disable XON/XOFF flow control even if configured.
    #[arg(long, overrides_with = "xonxoff")]
    no_xonxoff: bool,

    /// Enable RTS/CTS hardware flow control.
    #[arg(long, overrides_with = "no_rtscts")]
    rtscts: bool,

    /// Disable RTS/CTS flow control even if configured.
    #[arg(long, overrides_with = "rtscts")]
    no_rtscts: bool,

    /// Enable DSR/DTR flow control.
    #[arg(long, overrides_with = "no_dsrdtr")]
    dsrdtr: bool,

    /// Disable DSR/DTR flow control even if configured.
    #[arg(long, overrides_with = "dsrdtr")]
    no_dsrdtr: bool,

    /// Line ending appended to each sent line (lf, cr, crlf, lfcr, none, hex).
    #[arg(short, long, env = "TINYCOM_ENDING", value_name = "ENDING")]
    ending: Option<LineEnding>,

    /// Show sent lines in the output as if they had been received.
    #[arg(long, overrides_with = "no_echo")]
    echo: bool,

    /// Do not echo sent lines, even if configured.
    #[arg(long, overrides_with = "echo")]
    no_echo: bool,

    /// Show received data as hex pairs.
    #[arg(long, overrides_with = "no_hex")]
    hex: bool,

    /// Show received data as text, even if hex display is configured.
    #[arg(long, overrides_with = "hex")]
    no_hex: bool,

    /// Remove ANSI escape sequences from received data.
    #[arg(long, overrides_with = "no_strip")]
    strip: bool,

    /// Keep ANSI escape sequences, even if stripping is configured.
    #[arg(long, overrides_with = "strip")]
    no_strip: bool,

    /// Append everything displayed to this file.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Remember the port settings in the global configuration file.
    #[arg(long)]
    save: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

/// Map an error chain to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli) = cause.downcast_ref::<CliError>() {
            return match cli {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => EXIT_CANCELLED,
                CliError::Port(_) => 3,
            };
        }
        if let Some(lib) = cause.downcast_ref::<tinycom::Error>() {
            return match lib {
                tinycom::Error::Io(_) => 1,
                tinycom::Error::InvalidHex(_) | tinycom::Error::Config(_) => 2,
                _ => 3,
            };
        }
    }
    1
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Terminal(args) => commands::terminal::cmd_terminal(cli, args, &mut config),
        Commands::ListPorts { json } => commands::list_ports::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: tinycom completions bash \
                         (or use --install to auto-install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    if std::env::var_os("NO_COLOR").is_some() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(cli.verbose, cli.quiet);
    install_interrupt_handler();

    debug!(
        "tinycom v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            if code == EXIT_CANCELLED {
                eprintln!("{}", style(&err).yellow());
            } else {
                eprintln!(
                    "{} {err:#}",
                    style("Error:")
                        .red()
                        .bold()
                );
            }
            ExitCode::from(code)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_terminal_defaults() {
        let cli = Cli::try_parse_from(["tinycom", "terminal"]).unwrap();
        let Commands::Terminal(args) = cli.command else {
            panic!("expected terminal command");
        };
        assert!(cli.port.is_none());
        assert!(args.ending.is_none());
        assert!(!args.echo);
        assert!(!args.save);
    }

    #[test]
    fn test_cli_parse_terminal_with_all_options() {
        let cli = Cli::try_parse_from([
            "tinycom",
            "-p",
            "/dev/ttyUSB0",
            "-b",
            "9600",
            "terminal",
            "--data-bits",
            "7",
            "--parity",
            "even",
            "--stop-bits",
            "1.5",
            "--rtscts",
            "--ending",
            "lf",
            "--echo",
            "--hex",
            "--strip",
            "--log",
            "session.log",
            "--save",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(9600));
        let Commands::Terminal(args) = cli.command else {
            panic!("expected terminal command");
        };
        assert_eq!(args.data_bits, Some(DataBits::Seven));
        assert_eq!(args.parity, Some(Parity::Even));
        assert_eq!(args.stop_bits, Some(StopBits::OnePointFive));
        assert!(args.rtscts);
        assert!(!args.xonxoff);
        assert_eq!(args.ending, Some(LineEnding::Lf));
        assert!(args.echo && args.hex && args.strip && args.save);
        assert_eq!(args.log, Some(PathBuf::from("session.log")));
    }

    #[test]
    fn test_cli_negated_switches() {
        let cli = Cli::try_parse_from([
            "tinycom",
            "terminal",
            "--no-echo",
            "--no-rtscts",
            "--hex",
            "--no-hex",
        ])
        .unwrap();
        let Commands::Terminal(args) = cli.command else {
            panic!("expected terminal command");
        };
        assert!(args.no_echo && !args.echo);
        assert!(args.no_rtscts);
        assert!(args.no_hex && !args.hex);
    }

    #[test]
    fn test_cli_invalid_ending() {
        let result = Cli::try_parse_from(["tinycom", "terminal", "--ending", "crcr"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_invalid_parity() {
        let result = Cli::try_parse_from(["tinycom", "terminal", "--parity", "sometimes"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["tinycom", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["tinycom", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Zsh),
                install: false
            }
        ));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "tinycom",
            "list-ports",
            "-vv",
            "--quiet",
            "--non-interactive",
            "--config",
            "custom.toml",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
        assert_eq!(cli.config_path, Some(PathBuf::from("custom.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["tinycom"]).is_err());
    }

    #[test]
    fn test_exit_code_classification() {
        let usage: anyhow::Error = CliError::Usage("no ports".into()).into();
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled: anyhow::Error = CliError::Cancelled("cancelled".into()).into();
        assert_eq!(exit_code_for(&cancelled), EXIT_CANCELLED);

        let port: anyhow::Error = tinycom::Error::port_open("COM9", "busy").into();
        assert_eq!(exit_code_for(&port), 3);

        let write: anyhow::Error = tinycom::Error::Write("timeout".into()).into();
        assert_eq!(exit_code_for(&write), 3);

        let hex: anyhow::Error = tinycom::Error::InvalidHex("odd".into()).into();
        assert_eq!(exit_code_for(&hex), 2);

        let other = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn test_exit_code_looks_through_context() {
        let err = anyhow::Error::from(CliError::Port("lost".into())).context("terminal failed");
        assert_eq!(exit_code_for(&err), 3);
    }
}
