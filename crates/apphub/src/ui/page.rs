//! Text rendering of installation and start pages
//!
//! A terminal cannot show dropdowns, so each input is listed with its choices
//! and default, followed by the command line that submits the page.

use apphub_core::page::{Action, Component, Page};
use console::style;
use std::fmt::Write;

/// Render `page` of app `key` as plain text
pub fn render(page: &Page, key: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", style(&page.title).bold());
    let _ = writeln!(out);

    for component in &page.components {
        match component {
            Component::Markdown { text } => {
                let _ = writeln!(out, "{}", text.trim_end());
                let _ = writeln!(out);
            }
            Component::InstallLocation {
                choices, default, ..
            } => {
                let values: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                let _ = writeln!(
                    out,
                    "  {}  Install location: {}{}",
                    style("install_location").cyan(),
                    values.join(" | "),
                    default_suffix(default.as_ref().map(|d| d.to_string()).as_deref())
                );
            }
            Component::Dropdown {
                name,
                label,
                choices,
                default,
            } => {
                let _ = writeln!(
                    out,
                    "  {}  {}{}",
                    style(name).cyan(),
                    label,
                    default_suffix(default.as_deref())
                );
                for choice in choices {
                    let _ = writeln!(out, "      {:<16} {}", choice.value, style(&choice.label).dim());
                }
            }
            Component::Textbox {
                name,
                label,
                placeholder,
            } => {
                let hint = placeholder
                    .as_deref()
                    .map(|p| format!(" (e.g. {})", p))
                    .unwrap_or_default();
                let _ = writeln!(out, "  {}  {}{}", style(name).cyan(), label, hint);
            }
            Component::Button {
                label,
                action,
                inputs,
            } => {
                let verb = match action {
                    Action::Install => "install",
                    Action::Start => "start",
                };
                let flags: Vec<String> = inputs.iter().map(|i| format!("-i {}=...", i)).collect();
                let _ = writeln!(out);
                let _ = writeln!(
                    out,
                    "{}: apphub {} {} {}",
                    style(label).green().bold(),
                    verb,
                    key,
                    flags.join(" ")
                );
            }
            // Events are streamed to stdout while the hook runs
            Component::Log => {}
        }
    }
    out
}

fn default_suffix(default: Option<&str>) -> String {
    match default {
        Some(d) => format!(" [default: {}]", d),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphub_core::page::Choice;

    #[test]
    fn test_render_lists_inputs_and_submit_line() {
        console::set_colors_enabled(false);
        let mut page = Page::new("Install Demo");
        page.markdown("Installs the demo.");
        let location = page.install_location(false, None);
        let flavor = page.dropdown(
            "flavor",
            "Flavor",
            vec![Choice::new("a", "Plain"), Choice::new("b", "Fancy")],
            Some("a"),
        );
        page.installation_button(vec![location, flavor]);
        page.log();

        let text = render(&page, "demo");
        assert!(text.contains("Install Demo"));
        assert!(text.contains("Installs the demo."));
        assert!(text.contains("Install location: local [default: local]"));
        assert!(text.contains("Flavor [default: a]"));
        assert!(text.contains("Fancy"));
        assert!(text.contains("apphub install demo -i install_location=... -i flavor=..."));
    }
}
