//! Baseline invalidation on container restarts
//!
//! A restarted container's CPU counters start over. The calculator already
//! reports 0% for a counter that moved backwards, but a restart that lands
//! between two samples with a counter that happens to be larger would yield
//! a bogus delta. Following the runtime's event stream and dropping the
//! baseline on `start`/`restart` closes that gap; `destroy` frees the entry.

use super::MetricCalculator;
use crate::decode::JsonStreamDecoder;
use crate::error::Result;
use crate::models::{EventFilters, TelemetryEvent};
use crate::runtime::ContainerRuntime;
use crate::viewer::ReconnectPolicy;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartAction {
    Reset(String),
    Forget(String),
    Ignore,
}

impl RestartAction {
    pub fn classify(event: &TelemetryEvent) -> Self {
        if event.event_type != "container" || event.actor.id.is_empty() {
            return RestartAction::Ignore;
        }
        match event.action.as_str() {
            "start" | "restart" => RestartAction::Reset(event.actor.id.clone()),
            "destroy" => RestartAction::Forget(event.actor.id.clone()),
            _ => RestartAction::Ignore,
        }
    }
}

fn restart_filters() -> EventFilters {
    EventFilters {
        types: vec!["container".to_string()],
        actions: vec![
            "start".to_string(),
            "restart".to_string(),
            "destroy".to_string(),
        ],
    }
}

/// Follow container lifecycle events until `cancel` fires, resetting
/// baselines as containers restart. Stream failures are retried with
/// capped exponential backoff and never give up.
pub async fn watch_restarts(
    runtime: Arc<dyn ContainerRuntime>,
    calculator: Arc<MetricCalculator>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    info!("Watching container restarts");
    let filters = restart_filters();
    let mut attempt = 0u32;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = follow(runtime.as_ref(), &calculator, &filters, &mut attempt) => result,
        };

        match result {
            Ok(()) => debug!("Restart event stream ended"),
            Err(e) => warn!(error = %e, "Restart event stream failed"),
        }

        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    info!("Stopped watching container restarts");
}

async fn follow(
    runtime: &dyn ContainerRuntime,
    calculator: &MetricCalculator,
    filters: &EventFilters,
    attempt: &mut u32,
) -> Result<()> {
    let mut body = runtime.events(filters).await?;
    let mut decoder = JsonStreamDecoder::<TelemetryEvent>::new("runtime event");

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        // the stream is delivering again
        *attempt = 0;
        for event in decoder.feed(&chunk)? {
            match RestartAction::classify(&event) {
                RestartAction::Reset(id) => {
                    debug!(container_id = %id, action = %event.action, "Container restarted");
                    calculator.reset_baseline(&id);
                }
                RestartAction::Forget(id) => calculator.reset_baseline(&id),
                RestartAction::Ignore => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventActor, RawSample};
    use crate::runtime::{Script, ScriptedRuntime};
    use std::time::Duration;

    fn event(event_type: &str, action: &str, id: &str) -> TelemetryEvent {
        TelemetryEvent {
            event_type: event_type.to_string(),
            action: action.to_string(),
            actor: EventActor {
                id: id.to_string(),
                attributes: Default::default(),
            },
            time: 0,
            time_nano: 0,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            RestartAction::classify(&event("container", "start", "c1")),
            RestartAction::Reset("c1".to_string())
        );
        assert_eq!(
            RestartAction::classify(&event("container", "restart", "c1")),
            RestartAction::Reset("c1".to_string())
        );
        assert_eq!(
            RestartAction::classify(&event("container", "destroy", "c1")),
            RestartAction::Forget("c1".to_string())
        );
        assert_eq!(RestartAction::classify(&event("container", "die", "c1")), RestartAction::Ignore);
        assert_eq!(RestartAction::classify(&event("image", "start", "c1")), RestartAction::Ignore);
        assert_eq!(RestartAction::classify(&event("container", "start", "")), RestartAction::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_event_resets_baseline() {
        let body = concat!(
            r#"{"Type":"container","Action":"start","Actor":{"ID":"c1","Attributes":{}},"time":1,"timeNano":1}"#,
            "\n",
            r#"{"Type":"container","Action":"destroy","Actor":{"ID":"c2","Attributes":{}},"time":2,"timeNano":2}"#,
            "\n",
        );
        let runtime = Arc::new(ScriptedRuntime::new().with_events(Script::new().chunk(body).hold_open()));
        let calculator = Arc::new(MetricCalculator::new());
        calculator.calculate("c1", RawSample::default());
        calculator.calculate("c2", RawSample::default());
        calculator.calculate("c3", RawSample::default());

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_restarts(
            runtime.clone(),
            calculator.clone(),
            ReconnectPolicy::default(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!calculator.has_baseline("c1"));
        assert!(!calculator.has_baseline("c2"));
        assert!(calculator.has_baseline("c3"));
        assert_eq!(runtime.event_requests(), vec![restart_filters()]);

        cancel.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_is_retried() {
        let runtime = Arc::new(ScriptedRuntime::new().with_events(Script::new().fail("connection reset")));
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_restarts(
            runtime.clone(),
            Arc::new(MetricCalculator::new()),
            ReconnectPolicy::default(),
            cancel.clone(),
        ));

        // attempts at 0s, 1s, 3s (after the 1s and 2s backoffs)
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runtime.request_count(), 3);

        cancel.cancel();
        watcher.await.unwrap();
    }
}
