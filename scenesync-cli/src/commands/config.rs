//! `scenesync config` - inspect and edit config.ini without opening it.

use std::fmt::Write as _;

use clap::Subcommand;
use scenesync::config::{config_file_path, ConfigFile, ConfigKey};

use crate::error::CliError;

/// Shown for keys that have no value in the file.
const UNSET: &str = "<unset>";

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the stored value of one setting
    Get {
        /// Setting name, such as sync.dest or logging.level
        key: String,
    },

    /// Store a new value for a setting in config.ini
    Set {
        /// Setting name, such as sync.dest or logging.level
        key: String,

        /// New value; validated before the file is written
        value: String,
    },

    /// Print every known setting grouped by section
    List,

    /// Print where config.ini is read from
    Path,
}

pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Get { key } => {
            let config = ConfigFile::load()?;
            println!("{}", display_value(&lookup(&key)?.get(&config)));
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            let setting = lookup(&key)?;
            let mut config = ConfigFile::load()?;
            setting.set(&mut config, &value)?;
            config.save()?;
            println!("{} -> {}", setting.name(), value);
            Ok(())
        }
        ConfigCommands::List => {
            let config = ConfigFile::load()?;
            println!("; {}", config_file_path().display());
            print!("{}", render_listing(&config));
            Ok(())
        }
        ConfigCommands::Path => {
            println!("{}", config_file_path().display());
            Ok(())
        }
    }
}

fn lookup(key: &str) -> Result<ConfigKey, CliError> {
    key.parse().map_err(|_| {
        CliError::Config(format!(
            "No setting named '{}' (run `scenesync config list` for the full set)",
            key
        ))
    })
}

fn display_value(value: &str) -> &str {
    if value.is_empty() {
        UNSET
    } else {
        value
    }
}

/// INI-shaped dump of every setting, one `[section]` block per group.
fn render_listing(config: &ConfigFile) -> String {
    let mut out = String::new();
    let mut section = None;
    for key in ConfigKey::all() {
        if section != Some(key.section()) {
            if section.is_some() {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", key.section());
            section = Some(key.section());
        }
        let _ = writeln!(
            out,
            "{} = {}",
            key.key_name(),
            display_value(&key.get(config))
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_rejects_unknown_setting() {
        assert!(lookup("sync.dest").is_ok());
        let err = lookup("sync.nonsense").unwrap_err();
        assert!(err.to_string().contains("sync.nonsense"));
    }

    #[test]
    fn test_listing_groups_by_section() {
        let mut config = ConfigFile::default();
        config.sync.base_url = Some("http://mirror.invalid/".to_string());

        let listing = render_listing(&config);
        assert!(listing.starts_with("[sync]\n"));
        assert!(listing.contains("base_url = http://mirror.invalid/\n"));
        assert!(listing.contains(UNSET));
        let headers = listing.lines().filter(|l| l.starts_with('[')).count();
        let mut sections: Vec<_> = ConfigKey::all().iter().map(|k| k.section()).collect();
        sections.dedup();
        assert_eq!(headers, sections.len());
    }
}
