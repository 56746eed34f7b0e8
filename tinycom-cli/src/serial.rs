//! Interactive serial port selection.
//!
//! A port is chosen from, in order:
//! - the `--port` flag or `TINYCOM_PORT`
//! - the remembered port in the configuration
//! - the single openable port, when exactly one exists
//! - an interactive prompt over all openable ports
//!
//! Non-interactive mode never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info, warn},
    std::io::IsTerminal,
    tinycom::PortConfig,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail instead of prompting).
    pub non_interactive: bool,
}

/// Result of port selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPort {
    /// Port name to open.
    pub name: String,
    /// Whether the user picked it from a prompt.
    pub prompted: bool,
}

impl SelectedPort {
    fn given(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompted: false,
        }
    }
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select a serial port from flags, configuration, or the user.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(selected) = preselected_port(options, config) {
        return Ok(selected);
    }

    let ports = tinycom::list_available_ports()?;
    debug!("Openable ports: {ports:?}");

    if options.non_interactive {
        return select_non_interactive_port(ports);
    }

    match ports.len() {
        0 => Err(usage_err(
            "No serial ports found. Connect a device or pass --port",
        )),
        1 => {
            let selected = select_non_interactive_port(ports)?;
            info!("Auto-selected port: {}", selected.name);
            Ok(selected)
        },
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
    }
}

/// Port chosen without enumerating: explicit flag first, then configuration.
fn preselected_port(options: &SerialOptions, config: &Config) -> Option<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Some(SelectedPort::given(port_name));
    }
    config
        .port
        .name
        .as_ref()
        .map(|port_name| {
            debug!("Using port from config: {port_name}");
            SelectedPort::given(port_name)
        })
}

fn select_non_interactive_port(ports: Vec<String>) -> Result<SelectedPort> {
    let mut ports = ports.into_iter();
    match (ports.next(), ports.next()) {
        (Some(name), None) => Ok(SelectedPort::given(name)),
        (Some(_), Some(_)) => Err(usage_err(
            "Multiple serial ports found; choose one with --port",
        )),
        (None, _) => Err(usage_err(
            "No serial ports found. Connect a device or pass --port",
        )),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// Interactive port selection.
fn select_port_interactive(ports: Vec<String>) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&ports)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let name = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                name,
                prompted: true,
            })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Offer to remember a prompted port in the global configuration.
pub fn ask_remember_port(port: &PortConfig) -> Result<()> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember {} for next time?",
            port.port_name
        ))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?;

    if remember == Some(true) {
        match Config::save_port_globally(port) {
            Ok(path) => eprintln!(
                "{} Saved to {}",
                style("✓").green(),
                style(path.display()).yellow()
            ),
            Err(e) => warn!("Could not save port: {e:#}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_port_wins_over_config() {
        let mut config = Config::default();
        config.port.name = Some("/dev/ttyS0".to_string());
        let options = SerialOptions {
            port: Some("/dev/ttyUSB0".to_string()),
            non_interactive: true,
        };
        let selected = preselected_port(&options, &config).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
        assert!(!selected.prompted);
    }

    #[test]
    fn test_config_port_used_without_flag() {
        let mut config = Config::default();
        config.port.name = Some("COM4".to_string());
        let selected = preselected_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected, SelectedPort::given("COM4"));
    }

    #[test]
    fn test_nothing_preselected() {
        assert!(preselected_port(&SerialOptions::default(), &Config::default()).is_none());
    }

    #[test]
    fn test_non_interactive_single_port() {
        let selected = select_non_interactive_port(vec!["/dev/ttyACM0".to_string()]).unwrap();
        assert_eq!(selected.name, "/dev/ttyACM0");
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let err = select_non_interactive_port(vec!["COM1".to_string(), "COM2".to_string()])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(msg)) if msg.contains("Multiple")
        ));
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(Vec::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_prompt_interrupt_maps_to_cancelled() {
        let err = map_prompt_error(DialoguerError::IO(std::io::Error::from(
            std::io::ErrorKind::Interrupted,
        )));
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Cancelled(_))
        ));
    }
}
