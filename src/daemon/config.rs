use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;

pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("rpmemd");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str =
                fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The directory the pool backing files live in. Descriptors in client
    /// requests name files directly under it.
    pub poolset_dir: Option<String>,

    /// Select the appliance persistency method: the client guarantees
    /// durability through its own protocol and the daemon never flushes.
    /// When unset, the general-purpose method is used and every persist
    /// request triggers a flush on the daemon.
    pub persist_apm: Option<bool>,

    /// Route logs to syslog instead of stderr. Ignored when log_file
    /// is set.
    pub use_syslog: Option<bool>,

    /// The file to write logs to. Takes precedence over use_syslog.
    pub log_file: Option<String>,

    /// One of error, warn, info, debug or trace. The -v flag on the
    /// command line overrides this.
    pub log_level: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_parses_all_fields() {
        let config: Config = toml::from_str(
            r#"
            poolset_dir = "/var/lib/pools"
            persist_apm = true
            use_syslog = false
            log_file = "/tmp/rpmemd.log"
            log_level = "debug"
            "#,
        )
        .expect("config to parse");

        assert_eq!(config.poolset_dir.as_deref(), Some("/var/lib/pools"));
        assert_eq!(config.persist_apm, Some(true));
        assert_eq!(config.use_syslog, Some(false));
        assert_eq!(config.log_file.as_deref(), Some("/tmp/rpmemd.log"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").expect("config to parse");
        assert!(config.poolset_dir.is_none());
        assert!(config.persist_apm.is_none());
    }
}
