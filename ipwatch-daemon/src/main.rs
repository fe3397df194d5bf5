use anyhow::Result;
use tokio::signal::unix::SignalKind;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cmd::command_line::{get_config_from_opt, Opt};
use crate::cmd::control::client::ControlClient;
use crate::cmd::control::handler::ControlServer;
use crate::signal::Signals;
use crate::watch::exec::Watcher;

pub mod cmd;
pub mod raw_config;
pub mod signal;
pub mod watch;

async fn run_client(opt: &Opt) -> Result<()> {
    let path = match opt.control_path.clone() {
        Some(path) => path,
        None => return Ok(()),
    };
    let client = ControlClient::new(path);
    if let Some(ip) = &opt.check {
        println!("{}", client.request_check(ip, &opt.device).await?);
        return Ok(());
    }
    let mut events = client.subscribe().await?;
    while let Some(event) = events.next().await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args_checked()?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(opt.get_level_filter().into()))
        .init();

    if opt.is_client() {
        return run_client(&opt).await;
    }

    let config = get_config_from_opt(&opt).await?;
    let control_path = config.control_path.clone();
    let mut watcher = Watcher::new(config);
    watcher.start()?;

    let mut control_server = None;
    if let (Some(path), Some(engine)) = (control_path.clone(), watcher.engine()) {
        let mut server = ControlServer::new(engine, watcher.events());
        if let Err(e) = server.serve(path) {
            watcher.stop().await?;
            return Err(e);
        }
        control_server = Some(server);
    }

    let mut signals = Signals::from_kinds(&[SignalKind::interrupt(), SignalKind::terminate()])?;
    signals.wait().await?;

    if let Some(server) = control_server {
        server.stop().await?;
    }
    watcher.stop().await?;
    if let Some(path) = control_path {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("failed to remove {:?}: {}", path, e);
        }
    }
    Ok(())
}
