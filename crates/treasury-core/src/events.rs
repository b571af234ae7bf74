use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;
use treasury_types::TreasuryEvent;

/// Telemetry consumer. Emission never fails the operation that produced it.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TreasuryEvent);
}

/// Renders every event as a structured tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: TreasuryEvent) {
        match &event {
            TreasuryEvent::ActionCommitted(e) => info!(
                event = event.name(),
                action_id = %e.action_id,
                action_type = ?e.action_type,
                source = ?e.source_pool,
                dest = ?e.dest_pool,
                amount = %e.amount,
                "treasury action committed"
            ),
            TreasuryEvent::ProposalTransition(e) => info!(
                event = event.name(),
                proposal_id = %e.proposal_id,
                from = ?e.from_status,
                to = ?e.to_status,
                signer = ?e.signer,
                "governance proposal transition"
            ),
            TreasuryEvent::PlanCompleted(e) => info!(
                event = event.name(),
                plan_id = %e.plan_id,
                status = ?e.status,
                executed = e.actions_executed,
                pending = e.actions_pending,
                failed = e.actions_failed,
                total_moved = %e.total_moved,
                "rebalance plan pass finished"
            ),
        }
    }
}

/// Collects events in memory for assertions and dashboards.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<TreasuryEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TreasuryEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: TreasuryEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}
