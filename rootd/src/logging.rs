//! Log filter setup with runtime reload.
//!
//! `SetLogLevel` on the control socket swaps the filter and arms a timer that
//! restores the configured one once the duration elapses.

use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry, reload};

#[derive(Clone)]
pub(crate) struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    base_filter: String,
}

pub(crate) fn init(base_filter: &str) -> Result<LogHandle> {
    let filter = EnvFilter::try_new(base_filter)
        .with_context(|| format!("Invalid log filter `{base_filter}`"))?;

    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LogHandle {
        reload: handle,
        base_filter: base_filter.to_owned(),
    })
}

impl LogHandle {
    pub(crate) fn set_level(&self, level: &str, duration: Option<Duration>) -> Result<()> {
        let filter =
            EnvFilter::try_new(level).with_context(|| format!("Invalid log filter `{level}`"))?;

        self.reload
            .reload(filter)
            .context("Failed to swap log filter")?;

        tracing::info!(%level, ?duration, "Log level changed");

        if let Some(duration) = duration {
            let this = self.clone();

            tokio::spawn(async move {
                tokio::time::sleep(duration).await;

                match EnvFilter::try_new(&this.base_filter) {
                    Ok(filter) => {
                        if this.reload.reload(filter).is_ok() {
                            tracing::info!(filter = %this.base_filter, "Log level restored");
                        }
                    }
                    Err(e) => tracing::warn!("Failed to restore log filter: {e}"),
                }
            });
        }

        Ok(())
    }
}
