use anyhow::{anyhow, Result};
use futures::future::select_all;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Waits for the first of a set of unix signals.
#[derive(Debug)]
pub struct Signals(Vec<Signal>);

impl Signals {
    pub fn from_kinds(kinds: &[SignalKind]) -> Result<Self> {
        let signals = kinds
            .iter()
            .map(|kind| signal(*kind))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self(signals))
    }

    pub async fn wait(&mut self) -> Result<()> {
        if self.0.is_empty() {
            return Err(anyhow!("no signal to wait for"));
        }
        let (received, _, _) = select_all(self.0.iter_mut().map(|s| Box::pin(s.recv()))).await;
        match received {
            Some(()) => {
                tracing::info!("signal received, shutting down");
                Ok(())
            }
            None => Err(anyhow!("signal stream closed")),
        }
    }
}
