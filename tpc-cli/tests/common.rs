use std::path::Path;
use std::process::Command;

use insta::Settings;
use insta::internals::SettingsBindDropGuard;
use insta_cmd::get_cargo_bin;

pub fn run_cli() -> Command {
    let mut cmd = Command::new(get_cargo_bin("tpc"));
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Masks the parts of the output that change from run to run.
pub fn setup(dir: &Path) -> SettingsBindDropGuard {
    let mut settings = Settings::clone_current();
    settings.add_filter(r"54504321:[0-9a-f]{32}", "[GTID]");
    settings.add_filter(&regex_escape(&dir.to_string_lossy()), "[DIR]");
    settings.bind_to_scope()
}

fn regex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
