use std::path::Path;

use clap::Subcommand;

use crate::Result;
use crate::config::{self, Config, ConfigError};

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Print the resolved config as TOML.
    Show,
    /// Print the user config file location.
    Path,
    /// Write the default config to the config file if it does not exist.
    Init,
}

pub(crate) fn handle(cmd: ConfigCmd, resolved: &Config, explicit: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCmd::Show => {
            let rendered = toml::to_string_pretty(resolved).map_err(ConfigError::from)?;
            print!("{rendered}");
        }
        ConfigCmd::Path => println!("{}", config::config_path().display()),
        ConfigCmd::Init => {
            let path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(config::config_path);
            if path.exists() {
                println!("config already exists at {}", path.display());
            } else {
                config::write_config(&path, &Config::default())?;
                println!("wrote {}", path.display());
            }
        }
    }
    Ok(())
}
