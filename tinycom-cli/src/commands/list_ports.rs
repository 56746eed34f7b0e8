//! `list-ports` command implementation.

use anyhow::Result;
use console::style;

/// Print the ports that can be opened, as text on stderr or JSON on stdout.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = tinycom::list_available_ports()?;

    if json {
        println!("{}", render_json(&ports)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), style(port).cyan());
        }
    }
    Ok(())
}

fn render_json(ports: &[String]) -> Result<String> {
    let entries: Vec<serde_json::Value> = ports
        .iter()
        .map(|name| serde_json::json!({ "name": name }))
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_json_empty() {
        let out = render_json(&[]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, serde_json::json!([]));
    }

    #[test]
    fn test_render_json_keeps_order() {
        let ports = vec!["/dev/ttyACM0".to_string(), "/dev/ttyUSB0".to_string()];
        let parsed: serde_json::Value =
            serde_json::from_str(&render_json(&ports).unwrap()).unwrap();
        assert_eq!(parsed[0]["name"], "/dev/ttyACM0");
        assert_eq!(parsed[1]["name"], "/dev/ttyUSB0");
    }
}
