use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use ipwatch_daemon_lib::cmd::control::client::ControlClient;
use ipwatch_daemon_lib::cmd::control::handler::ControlServer;
use ipwatch_daemon_lib::raw_config::RawConfig;
use ipwatch_daemon_lib::watch::config::Config;
use ipwatch_daemon_lib::watch::exec::Watcher;
use ipwatch_engine::memory::{reply_frame, MemoryTransport, StaticDeviceInfo, Wire};
use ipwatch_engine::notify::ConflictKind;
use std::convert::TryInto;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn uds_path() -> PathBuf {
    env::temp_dir()
        .join(Uuid::new_v4().to_string())
        .with_extension("sock")
}

async fn start(path: PathBuf) -> anyhow::Result<(Watcher, ControlServer, Arc<Wire>)> {
    let config: Config = RawConfig::default().try_into()?;
    let (transport, wire) = MemoryTransport::new();
    let provider = StaticDeviceInfo::new(vec![(
        "eth0".to_string(),
        "192.168.1.10".parse()?,
        "aa:aa:aa:aa:aa:aa".parse()?,
    )]);
    let mut watcher = Watcher::new(config);
    watcher.start_with(Box::new(transport), Arc::new(provider))?;
    let engine = watcher
        .engine()
        .ok_or_else(|| anyhow::anyhow!("engine not started"))?;
    let mut server = ControlServer::new(engine, watcher.events());
    server.serve(path)?;
    Ok((watcher, server, wire))
}

#[tokio::test]
async fn test_check_over_uds() -> anyhow::Result<()> {
    let path = uds_path();
    let (mut watcher, server, wire) = start(path.clone()).await?;
    wire.respond_with(|frame| {
        // only the probe for .50 is answered
        if frame.len() >= 42 && frame[38..42] == [192, 168, 1, 50] {
            Some(reply_frame(
                "192.168.1.50".parse().ok()?,
                "bb:bb:bb:bb:bb:bb".parse().ok()?,
            ))
        } else {
            None
        }
    });

    let client = ControlClient::new(path.clone());
    assert_eq!(
        client.request_check("192.168.1.50", "").await?,
        "bb:bb:bb:bb:bb:bb"
    );
    assert_eq!(client.request_check("192.168.1.51", "eth0").await?, "");
    assert_eq!(client.request_check("not-an-ip", "").await?, "");

    server.stop().await?;
    watcher.stop().await?;
    std::fs::remove_file(path)?;
    Ok(())
}

#[tokio::test]
async fn test_events_over_uds() -> anyhow::Result<()> {
    let path = uds_path();
    let (mut watcher, server, wire) = start(path.clone()).await?;

    let client = ControlClient::new(path.clone());
    let mut events = client.subscribe().await?;
    wire.push(reply_frame(
        "192.168.1.10".parse()?,
        "bb:bb:bb:bb:bb:bb".parse()?,
    ));

    let event = timeout(Duration::from_secs(5), events.next())
        .await??
        .ok_or_else(|| anyhow::anyhow!("event stream closed"))?;
    assert_eq!(event.kind, ConflictKind::Conflict);
    assert_eq!(event.ip, "192.168.1.10");
    assert_eq!(event.device, "eth0");
    assert_eq!(event.foreign_mac, "bb:bb:bb:bb:bb:bb");
    tracing::debug!("received {:?}", event);

    server.stop().await?;
    watcher.stop().await?;
    std::fs::remove_file(path)?;
    Ok(())
}
