use std::net::{Ipv4Addr, SocketAddr};

use player_types::{DeviceAddr, Error, Result};
use serde_derive::Deserialize;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_listen() -> Vec<SocketAddr> {
    vec!["0.0.0.0:6665".parse().unwrap()]
}

fn def_product_name() -> String {
    String::from("Player")
}

fn def_version() -> String {
    String::from(env!("CARGO_PKG_VERSION"))
}

fn def_access() -> char {
    'a'
}

/// A device address as written in the config file: an IPv4 host
/// (almost always the loopback or wildcard address -- the real host
/// byte is overwritten per-connection anyway) plus the
/// robot/interface/index triple.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct DeviceAddrCfg {
    #[serde(default = "def_host")]
    pub host: Ipv4Addr,
    pub robot: u16,
    pub interface: u16,
    #[serde(default)]
    pub index: u16,
}

fn def_host() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl DeviceAddrCfg {
    pub fn to_addr(self) -> DeviceAddr {
        DeviceAddr::new(u32::from_be_bytes(self.host.octets()), self.robot, self.interface, self.index)
    }
}

/// One of the toy fixture drivers (`echo`, `config`), registered
/// under the address given here.
#[derive(Deserialize, Debug)]
pub struct DriverCfg {
    pub kind: String,
    pub addr: DeviceAddrCfg,
    #[serde(default = "def_access")]
    pub access: char,
    pub name: Option<String>,
}

/// A device bridged in from another Player server.
#[derive(Deserialize, Debug)]
pub struct RemoteCfg {
    pub peer: SocketAddr,
    pub addr: DeviceAddrCfg,
    #[serde(default = "def_access")]
    pub access: char,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,
    #[serde(default = "def_listen")]
    pub listen: Vec<SocketAddr>,
    #[serde(default = "def_product_name")]
    pub product_name: String,
    #[serde(default = "def_version")]
    pub version: String,
    pub auth_key: Option<String>,
    #[serde(default)]
    pub driver: Vec<DriverCfg>,
    #[serde(default)]
    pub remote: Vec<RemoteCfg>,
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
            listen: def_listen(),
            product_name: def_product_name(),
            version: def_version(),
            auth_key: None,
            driver: Vec::new(),
            remote: Vec::new(),
        }
    }
}

/// Overlays command-line flags onto a parsed (or default) `Config`,
/// with `-v`-stacks-to-increase-verbosity and `--print-config`
/// conventions.
fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    let matches = Command::new("Player")
        .version(crate_version!())
        .about("Message bus and TCP transport core for robot device I/O")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .action(ArgAction::Set)
                .value_name("PORT")
                .help("Overrides the listen port (binds 0.0.0.0:<PORT>)"),
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
    }

    if let Some(port) = matches.get_one::<String>("port") {
        match port.parse::<u16>() {
            Ok(p) => cfg.listen = vec![SocketAddr::from(([0, 0, 0, 0], p))],
            Err(_) => eprintln!("warning: ignoring unparsable --port value {port:?}"),
        }
    }

    if let Some(path) = matches.get_one::<String>("config") {
        cfg = load_file(path).unwrap_or_else(|e| {
            eprintln!("error reading {path}: {e}");
            std::process::exit(1);
        });
        // Re-apply the flags above: a config file shouldn't silently
        // override a verbosity/port flag the user passed alongside it.
        match matches.get_count("verbose") {
            0 => (),
            1 => cfg.log_level = String::from("info"),
            2 => cfg.log_level = String::from("debug"),
            _ => cfg.log_level = String::from("trace"),
        }
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(p) = port.parse::<u16>() {
                cfg.listen = vec![SocketAddr::from(([0, 0, 0, 0], p))];
            }
        }
    }

    (matches.get_flag("print_cfg"), cfg)
}

fn load_file(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::Io(e.to_string()))?;
    toml::from_str(&contents).map_err(|e| Error::Io(format!("parsing {path}: {e}")))
}

/// Builds the final configuration from the command line (and, if
/// `--config` names one, a TOML file), or exits the process if the
/// user only asked to print it.
pub fn get() -> Option<Config> {
    let (print_cfg, cfg) = from_cmdline(Config::default());

    if print_cfg {
        println!("{cfg:#?}");
        return None;
    }

    Some(cfg)
}
