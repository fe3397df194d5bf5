use std::convert::TryInto;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use structopt::StructOpt;
use tokio::fs::read_to_string;
use tracing_subscriber::filter::LevelFilter;

use crate::raw_config::RawConfig;
use crate::watch::config::Config;

#[derive(Debug, StructOpt)]
#[structopt(name = "ipwatch", about = "Detects IPv4 address conflicts over ARP.")]
pub struct Opt {
    /// path of config file (.yaml, .yml or .json). Every usable interface is
    /// watched in passive mode when omitted.
    #[structopt(name = "FILE", parse(from_os_str))]
    pub input: Option<PathBuf>,

    /// Unix socket of the control server, overrides `control_path` of the
    /// config file.
    #[structopt(long, parse(from_os_str))]
    pub control_path: Option<PathBuf>,

    /// Ask a running daemon whether this IPv4 address is in use and print the
    /// MAC that answered.
    #[structopt(long)]
    pub check: Option<String>,

    /// Interface used by `--check`. Chosen from the address when empty.
    #[structopt(long, default_value = "")]
    pub device: String,

    /// Print conflict events of a running daemon as they happen.
    #[structopt(long)]
    pub events: bool,

    // The number of occurrences of the `v/verbose` flag
    /// Verbose mode (-v, -vv, -vvv, etc.)
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl Opt {
    pub fn get_level_filter(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    pub fn from_args_checked() -> Result<Self> {
        Self::from_args_safe()?.checked()
    }

    /// Client modes talk to a running daemon and need its socket.
    pub fn is_client(&self) -> bool {
        self.check.is_some() || self.events
    }

    fn checked(self) -> Result<Self> {
        if self.check.is_some() && self.events {
            return Err(anyhow!("`--check` and `--events` can not be used together"));
        }
        if self.is_client() && self.control_path.is_none() {
            return Err(anyhow!(
                "`--control-path` is required to reach a running daemon, see `--help`"
            ));
        }
        if !self.device.is_empty() && self.check.is_none() {
            return Err(anyhow!("`--device` only applies to `--check`"));
        }
        Ok(self)
    }
}

pub async fn get_config_from_opt(opt: &Opt) -> Result<Config> {
    let mut config: Config = match opt.input {
        None => RawConfig::default(),
        Some(ref path_buf) => {
            let buffer = read_to_string(path_buf).await?;
            match path_buf.extension().and_then(|ext| ext.to_str()) {
                Some("json") => serde_json::from_str(&buffer)?,
                Some("yaml") | Some("yml") => serde_yaml::from_str(&buffer)?,
                _ => return Err(anyhow!("invalid file extension")),
            }
        }
    }
    .try_into()?;
    if opt.control_path.is_some() {
        config.control_path = opt.control_path.clone();
    }
    Ok(config)
}
