use canbus_manager::ManagerConfig;
use serde_derive::Deserialize;
use std::env;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,

    #[serde(flatten)]
    pub manager: ManagerConfig,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            manager: ManagerConfig::default(),
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    let matches = Command::new("canbusd")
        .version(crate_version!())
        .about("Multi-client manager for a simulated CAN/TWAI controller")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config, String> {
    toml::from_str(contents).map_err(|e| e.to_string())
}

async fn from_file(path: &str) -> Option<Result<Config, String>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);
        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg() -> Result<Config, String> {
    const CFG_FILE: &str = "canbus.toml";

    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/etc/"));

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}\n", cfg.get_log_level());
    println!("Bus configuration:");
    println!("    bitrate: {:?}", cfg.manager.bitrate);
    println!("    loopback: {}", cfg.manager.loopback);
    println!("    tx timeout (ms): {}", cfg.manager.tx_timeout_ms);
    println!("    snapshot capacity: {}", cfg.manager.snapshot_capacity);
    println!(
        "    bus-off recovery delay (ms): {}",
        cfg.manager.bus_off_recovery_delay_ms
    );
}

#[tracing::instrument(name = "loading config")]
pub async fn get() -> Option<Config> {
    match find_cfg().await {
        Ok(cfg) => {
            let (print_cfg, cfg) = from_cmdline(cfg);

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_an_empty_document() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.get_log_level(), Level::WARN);
        assert!(!cfg.manager.loopback);
    }

    #[test]
    fn log_level_is_settable() {
        let cfg: Config = toml::from_str("log_level = \"debug\"").unwrap();
        assert_eq!(cfg.get_log_level(), Level::DEBUG);
    }

    #[test]
    fn manager_fields_are_flattened_into_the_same_document() {
        let cfg: Config = toml::from_str(
            r#"
loopback = true
snapshot_capacity = 16
"#,
        )
        .unwrap();
        assert!(cfg.manager.loopback);
        assert_eq!(cfg.manager.snapshot_capacity, 16);
    }
}
