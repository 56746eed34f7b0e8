//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN_NAME: &str = "tinycom";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN_NAME, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var_os("PSModulePath").is_some() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Map a shell binary path such as `/usr/bin/zsh` to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path)
        .file_name()?
        .to_str()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// `$var` if set, else `~/<fallback>`.
fn xdg_dir(dirs: &BaseDirs, var: &str, fallback: &str) -> PathBuf {
    env::var_os(var).map_or_else(
        || {
            dirs.home_dir()
                .join(fallback)
        },
        PathBuf::from,
    )
}

/// Where completion scripts for `shell` are picked up automatically.
fn completion_install_path(dirs: &BaseDirs, shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir(dirs, "XDG_DATA_HOME", ".local/share")
            .join("bash-completion/completions")
            .join(BIN_NAME),
        Shell::Zsh => dirs
            .home_dir()
            .join(".zfunc")
            .join(format!("_{BIN_NAME}")),
        Shell::Fish => xdg_dir(dirs, "XDG_CONFIG_HOME", ".config")
            .join("fish/completions")
            .join(format!("{BIN_NAME}.fish")),
        Shell::Elvish => xdg_dir(dirs, "XDG_CONFIG_HOME", ".config")
            .join("elvish/lib")
            .join(format!("{BIN_NAME}.elv")),
        Shell::PowerShell => env::var_os("PROFILE")
            .and_then(|profile| {
                Path::new(&profile)
                    .parent()
                    .map(Path::to_path_buf)
            })
            .unwrap_or_else(|| {
                xdg_dir(dirs, "XDG_CONFIG_HOME", ".config").join("powershell/completions")
            })
            .join(format!("{BIN_NAME}.ps1")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// What the user still has to do after installing.
fn activation_hint(shell: Shell, path: &Path) -> Option<String> {
    match shell {
        Shell::Bash => Some(format!("To activate now: source {}", path.display())),
        Shell::Zsh => Some(
            "Make sure ~/.zshrc contains `fpath=(~/.zfunc $fpath)` before \
             `compinit`, then restart your shell"
                .to_string(),
        ),
        Shell::PowerShell => Some(format!(
            "Add `Import-Module {}` to your PowerShell profile",
            path.display()
        )),
        _ => None,
    }
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             tinycom completions --install bash",
        )?,
    };
    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = completion_install_path(&dirs, shell)?;

    let mut script = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓")
            .green()
            .bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );
    if let Some(hint) = activation_hint(shell, &path) {
        eprintln!("{hint}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path_known() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("bash"), Some(Shell::Bash));
    }

    #[test]
    fn test_shell_from_path_unknown() {
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths_end_with_script_name() {
        let Some(dirs) = BaseDirs::new() else {
            return;
        };
        let bash = completion_install_path(&dirs, Shell::Bash).unwrap();
        assert!(bash.ends_with("bash-completion/completions/tinycom"));

        let zsh = completion_install_path(&dirs, Shell::Zsh).unwrap();
        assert!(zsh.ends_with(".zfunc/_tinycom"));

        let fish = completion_install_path(&dirs, Shell::Fish).unwrap();
        assert!(fish.ends_with("fish/completions/tinycom.fish"));

        let elvish = completion_install_path(&dirs, Shell::Elvish).unwrap();
        assert!(elvish.ends_with("tinycom.elv"));

        let pwsh = completion_install_path(&dirs, Shell::PowerShell).unwrap();
        assert!(pwsh.ends_with("tinycom.ps1"));
    }

    #[test]
    fn test_activation_hint() {
        let path = Path::new("/tmp/tinycom");
        assert!(
            activation_hint(Shell::Bash, path)
                .unwrap()
                .contains("source /tmp/tinycom")
        );
        assert!(activation_hint(Shell::Fish, path).is_none());
    }

    #[test]
    fn test_generated_script_mentions_binary() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            let mut buf = Vec::new();
            generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);
            let output = String::from_utf8(buf).unwrap();
            assert!(output.contains("tinycom"), "{shell} script");
        }
    }
}
