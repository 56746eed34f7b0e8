//! Interactive line terminal.
//!
//! - Input thread: stdin lines → channel
//! - Main thread: pumps reader events, handles typed lines
//! - Received data goes to stdout; status lines and errors go to stderr
//! - Ctrl+C or `:quit`: close the port and exit
//!
//! Lines starting with `:` are local commands (see [`HELP`]); `::text` sends
//! a literal `:text`.

use anyhow::{Context, Result};
use console::style;
use log::{debug, warn};
use std::io::{self, BufRead as _, Write as _};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};
use tinycom::{
    COMMON_BAUD_RATES, DEFAULT_BAUD_RATE, DisplayOptions, DisplaySink, LineEnding, LogFile,
    PortConfig, SerialSession, SessionController,
};

use crate::config::Config;
use crate::serial::{SerialOptions, ask_remember_port, select_serial_port};
use crate::{Cli, CliError, TerminalArgs, clear_interrupted_flag, was_interrupted};

/// How long one pump waits for reader events.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Keep showing received data this long after stdin closes.
const EOF_DRAIN: Duration = Duration::from_millis(500);

const HELP: &str = "\
Local commands:
  :history          list sent lines
  :resend N         send history entry N again
  :ending POLICY    lf, cr, crlf, lfcr, none or hex
  :echo on|off      show sent lines in the output
  :hex on|off       show received data as hex
  :strip on|off     remove ANSI escape sequences
  :stats            byte counters
  :clear            forget the history
  :help             this text
  :quit             close the port and exit
  ::text            send the literal line `:text`";

/// Writes received text to stdout and everything else to stderr.
pub(crate) struct ConsoleSink {
    quiet: bool,
}

impl ConsoleSink {
    pub(crate) fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Reply to a local command; shown even in quiet mode.
    fn note(&self, message: &str) {
        eprintln!("{} {message}", style("›").cyan());
    }
}

impl DisplaySink for ConsoleSink {
    fn show(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn status(&mut self, message: &str) {
        if !self.quiet {
            eprintln!("{} {}", style("ℹ").blue(), style(message).dim());
        }
    }

    fn traffic(&mut self, message: &str) {
        debug!("{message}");
    }

    fn error(&mut self, title: &str, message: &str) {
        eprintln!(
            "{} {}: {message}",
            style("✗").red(),
            style(title)
                .red()
                .bold()
        );
    }
}

/// A typed line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Send(String),
    History,
    Resend(usize),
    Ending(LineEnding),
    Echo(bool),
    Hex(bool),
    Strip(bool),
    Stats,
    Clear,
    Help,
    Quit,
    Invalid(String),
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "1" | "true" | "yes" => Some(true),
        "off" | "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_input(line: &str) -> Input {
    let Some(command) = line.strip_prefix(':') else {
        return Input::Send(line.to_string());
    };
    if command.starts_with(':') {
        return Input::Send(command.to_string());
    }

    let mut words = command.split_whitespace();
    let name = words
        .next()
        .unwrap_or_default();
    let arg = words.next();
    let switch = |make: fn(bool) -> Input| match arg.and_then(parse_switch) {
        Some(on) => make(on),
        None => Input::Invalid(format!(":{name} expects on or off")),
    };

    match name {
        "history" => Input::History,
        "resend" => match arg.map(str::parse::<usize>) {
            Some(Ok(index)) => Input::Resend(index),
            _ => Input::Invalid(":resend expects a history index".to_string()),
        },
        "ending" => match arg.map(str::parse::<LineEnding>) {
            Some(Ok(ending)) => Input::Ending(ending),
            Some(Err(e)) => Input::Invalid(e.to_string()),
            None => Input::Invalid(":ending expects lf, cr, crlf, lfcr, none or hex".to_string()),
        },
        "echo" => switch(Input::Echo),
        "hex" => switch(Input::Hex),
        "strip" => switch(Input::Strip),
        "stats" => Input::Stats,
        "clear" => Input::Clear,
        "help" | "?" => Input::Help,
        "quit" | "q" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command :{other} (try :help)")),
    }
}

/// Build the port configuration: flags, then configuration, then defaults.
fn resolve_port_config(
    port_name: &str,
    baud: Option<u32>,
    args: &TerminalArgs,
    config: &Config,
) -> PortConfig {
    let stored = &config.port;
    let mut port = PortConfig::new(
        port_name,
        baud.or(stored.baud)
            .unwrap_or(DEFAULT_BAUD_RATE),
    );
    port.data_bits = args
        .data_bits
        .or(stored.data_bits)
        .unwrap_or_default();
    port.parity = args
        .parity
        .or(stored.parity)
        .unwrap_or_default();
    port.stop_bits = args
        .stop_bits
        .or(stored.stop_bits)
        .unwrap_or_default();
    port.software_flow_control = switch(args.xonxoff, args.no_xonxoff)
        .or(stored.software_flow_control)
        .unwrap_or(false);
    port.hardware_flow_control = switch(args.rtscts, args.no_rtscts)
        .or(stored.hardware_flow_control)
        .unwrap_or(false);
    port.dsr_dtr_flow_control = switch(args.dsrdtr, args.no_dsrdtr)
        .or(stored.dsr_dtr_flow_control)
        .unwrap_or(false);
    port
}

/// A `--x` / `--no-x` pair: `None` when neither was given.
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    }
}

fn resolve_display_options(args: &TerminalArgs, config: &Config) -> DisplayOptions {
    let stored = &config.terminal;
    DisplayOptions {
        strip_escape_codes: switch(args.strip, args.no_strip)
            .or(stored.strip_escape_codes)
            .unwrap_or(false),
        hex_display: switch(args.hex, args.no_hex)
            .or(stored.hex_display)
            .unwrap_or(false),
        echo: switch(args.echo, args.no_echo)
            .or(stored.echo)
            .unwrap_or(false),
    }
}

fn resolve_line_ending(args: &TerminalArgs, config: &Config) -> LineEnding {
    args.ending
        .or(config
            .terminal
            .line_ending)
        .unwrap_or_default()
}

fn resolve_log_path(args: &TerminalArgs, config: &Config) -> Option<PathBuf> {
    args.log
        .clone()
        .or_else(|| {
            config
                .terminal
                .log_file
                .clone()
        })
}

enum StdinEvent {
    Line(String),
    Eof,
}

fn spawn_stdin_reader() -> Result<Receiver<StdinEvent>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("tinycom-stdin".to_string())
        .spawn(move || {
            for line in io::stdin()
                .lock()
                .lines()
            {
                match line {
                    Ok(line) => {
                        if tx
                            .send(StdinEvent::Line(line))
                            .is_err()
                        {
                            return;
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read input: {e}");
                        break;
                    },
                }
            }
            let _ = tx.send(StdinEvent::Eof);
        })
        .context("Failed to start input thread")?;
    Ok(rx)
}

/// What the loop does after a line was handled.
enum Flow {
    Continue,
    Quit,
}

fn handle_input(
    controller: &mut SessionController<ConsoleSink>,
    ending: &mut LineEnding,
    input: Input,
) -> Flow {
    let mut options = controller.options();
    match input {
        Input::Send(text) => {
            // Failures are already reported through the sink.
            let _ = controller.send(&text, *ending);
        },
        Input::Resend(index) => {
            let _ = controller.resend(index, *ending);
        },
        Input::History => {
            if controller
                .history()
                .is_empty()
            {
                controller
                    .sink()
                    .note("history is empty");
            }
            for (index, line) in controller
                .history()
                .iter()
                .enumerate()
            {
                controller
                    .sink()
                    .note(&format!("[{index}] {line}"));
            }
        },
        Input::Ending(policy) => {
            *ending = policy;
            controller
                .sink()
                .note(&format!("line ending: {policy}"));
        },
        Input::Echo(on) => {
            options.echo = on;
            controller.set_options(options);
        },
        Input::Hex(on) => {
            options.hex_display = on;
            controller.set_options(options);
        },
        Input::Strip(on) => {
            options.strip_escape_codes = on;
            controller.set_options(options);
        },
        Input::Stats => {
            let counters = controller.counters();
            controller
                .sink()
                .note(&format!(
                    "rx {} bytes, tx {} bytes",
                    counters.rx_bytes, counters.tx_bytes
                ));
        },
        Input::Clear => {
            controller.clear_history();
            controller
                .sink()
                .note("history cleared");
        },
        Input::Help => {
            for line in HELP.lines() {
                controller
                    .sink()
                    .note(line);
            }
        },
        Input::Quit => return Flow::Quit,
        Input::Invalid(message) => {
            controller
                .sink_mut()
                .error("Input Error", &message);
        },
    }
    Flow::Continue
}

/// Run the interactive terminal until `:quit`, Ctrl+C, end of input or a
/// fatal read error.
pub(crate) fn cmd_terminal(cli: &Cli, args: &TerminalArgs, config: &mut Config) -> Result<()> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        non_interactive: cli.non_interactive,
    };
    let selected = select_serial_port(&options, config)?;
    let port_config = resolve_port_config(&selected.name, cli.baud, args, config);
    if !COMMON_BAUD_RATES.contains(&port_config.baud_rate) {
        warn!("Non-standard baud rate {}", port_config.baud_rate);
    }

    let mut controller = SessionController::new(SerialSession::native(), ConsoleSink::new(cli.quiet));
    controller.set_options(resolve_display_options(args, config));
    if let Some(path) = resolve_log_path(args, config) {
        let log = LogFile::open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Logging to {}",
                style("📝").cyan(),
                style(path.display()).yellow()
            );
        }
        controller.set_log_file(Some(log));
    }

    if controller
        .open(&port_config)
        .is_err()
    {
        return Err(CliError::Port(format!("could not open {}", port_config.port_name)).into());
    }

    if args.save {
        let path = Config::save_port_globally(&port_config)?;
        config.remember_port(&port_config);
        debug!("Port settings saved to {}", path.display());
    } else if selected.prompted && !cli.non_interactive {
        ask_remember_port(&port_config)?;
    }

    let mut ending = resolve_line_ending(args, config);
    if !cli.quiet {
        eprintln!(
            "{}",
            style(format!(
                "Line ending: {ending}. Type :help for commands, Ctrl+C to exit."
            ))
            .dim()
        );
    }

    let input = spawn_stdin_reader()?;
    let mut drain_until: Option<Instant> = None;

    loop {
        if was_interrupted() {
            clear_interrupted_flag();
            break;
        }

        controller.pump(PUMP_INTERVAL);
        if !controller.is_open() {
            return Err(CliError::Port(format!(
                "{} was closed after a read error",
                port_config.port_name
            ))
            .into());
        }

        if let Some(deadline) = drain_until {
            if Instant::now() >= deadline {
                break;
            }
            continue;
        }

        let mut quit = false;
        loop {
            match input.try_recv() {
                Ok(StdinEvent::Line(line)) => {
                    if let Flow::Quit = handle_input(&mut controller, &mut ending, parse_input(&line))
                    {
                        quit = true;
                        break;
                    }
                },
                Ok(StdinEvent::Eof) | Err(TryRecvError::Disconnected) => {
                    debug!("End of input; draining for {EOF_DRAIN:?}");
                    drain_until = Some(Instant::now() + EOF_DRAIN);
                    break;
                },
                Err(TryRecvError::Empty) => break,
            }
        }
        if quit {
            break;
        }
    }

    controller.close();
    Ok(())
}
