//! Periodic context broadcast.
//!
//! One timer per bridge. Provider and broadcast failures are logged and the
//! schedule keeps running; only `stop_auto_sync()`/`stop()` end it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::BridgeInner;
use crate::bridge::handlers::ContextProvider;

pub(crate) fn spawn(
    inner: Arc<BridgeInner>,
    provider: Option<Arc<dyn ContextProvider>>,
) -> JoinHandle<()> {
    let interval = inner.config.context_sharing.sync_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first sync happens one period in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let context = match &provider {
                Some(provider) => match provider.provide().await {
                    Ok(context) => Some(context),
                    Err(err) => {
                        tracing::warn!(error = %err, "context provider failed; skipping sync");
                        continue;
                    }
                },
                None => None,
            };
            inner.auto_sync_tick(context).await;
        }
    })
}
