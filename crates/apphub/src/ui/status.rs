//! Text rendering of app status

use apphub_core::host::{AppState, AppStatus};
use console::style;
use std::fmt::Write;

fn styled_state(state: AppState) -> String {
    let text = format!("{:<11}", state.as_str());
    match state {
        AppState::Running => style(text).green().to_string(),
        AppState::Installed => style(text).cyan().to_string(),
        AppState::Stale | AppState::Incomplete => style(text).yellow().to_string(),
        AppState::Uninstalled => style(text).dim().to_string(),
    }
}

/// One line per app
pub fn render_table(statuses: &[AppStatus]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<24} {:<6} {}", "KEY", "NAME", "PORT", "STATE");
    for status in statuses {
        let _ = writeln!(
            out,
            "{:<12} {:<24} {:<6} {}",
            status.key,
            status.name,
            status.port,
            styled_state(status.state)
        );
    }
    out
}

/// Details of a single app
pub fn render_detail(status: &AppStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", style(&status.name).bold(), status.key);
    let _ = writeln!(out, "  state:     {}", styled_state(status.state).trim_end());
    let _ = writeln!(out, "  port:      {}", status.port);
    if let Some(location) = status.install_location {
        let _ = writeln!(out, "  location:  {}", location);
    }
    if let Some(root) = &status.install_root {
        let _ = writeln!(out, "  root:      {}", root.display());
    }
    if let Some(at) = status.installed_at {
        let _ = writeln!(out, "  installed: {}", at.to_rfc3339());
    }
    if let Some(run) = &status.run {
        let _ = writeln!(out, "  pid:       {}", run.pid);
        let _ = writeln!(out, "  command:   {}", run.command);
        if let Some(log) = &run.log_file {
            let _ = writeln!(out, "  log:       {}", log.display());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: AppState) -> AppStatus {
        AppStatus {
            key: "comfyui".to_string(),
            name: "ComfyUI".to_string(),
            port: 23810,
            state,
            install_location: None,
            install_root: None,
            installed_at: None,
            run: None,
        }
    }

    #[test]
    fn test_table_has_header_and_rows() {
        console::set_colors_enabled(false);
        let text = render_table(&[status(AppState::Uninstalled)]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("KEY"));
        assert!(lines[1].contains("ComfyUI"));
        assert!(lines[1].contains("23810"));
        assert!(lines[1].contains("uninstalled"));
    }

    #[test]
    fn test_detail_omits_missing_fields() {
        console::set_colors_enabled(false);
        let text = render_detail(&status(AppState::Uninstalled));
        assert!(text.contains("state:     uninstalled"));
        assert!(!text.contains("root:"));
        assert!(!text.contains("pid:"));
    }
}
