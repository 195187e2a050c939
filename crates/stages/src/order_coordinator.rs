//! Turns signals into orders.
//!
//! One order row exists per strategy and symbol, keyed `<strategy>@<symbol>`.
//! Each row remembers the `interval_begin` of the signal map that last
//! changed it; maps at or before that interval are redeliveries and are
//! dropped before anything is submitted. A signal that matches the direction
//! of the open leg is dropped too. An opposite signal flattens the open leg;
//! any signal with no open leg opens a new one.

use crate::{receive, Received};
use algo_pipeline_core::{
    BusSubscriber, ExecutionHandler, OrderAction, OrderFill, OrderRecord, OrderRequest,
    OrderState, OrderStore, SignalMap, Stage, StageError, StepOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

/// The order row after `fill` executed `action` for `signal_name`, triggered
/// by the signal map of `signal_interval`.
///
/// `existing` must not be an open leg in the same direction.
#[must_use]
pub fn next_order(
    existing: Option<OrderRecord>,
    signal_name: &str,
    symbol: &str,
    action: OrderAction,
    volume: Decimal,
    signal_interval: DateTime<Utc>,
    fill: &OrderFill,
) -> OrderRecord {
    match existing {
        Some(open) if open.state == OrderState::Open => {
            let pnl = open.pnl + open.realized_pnl(fill.price);
            OrderRecord {
                state: OrderState::Closed,
                close_price: Some(fill.price),
                pnl,
                timestamp: fill.timestamp,
                signal_interval: Some(signal_interval),
                ..open
            }
        }
        previous => OrderRecord {
            signal_name: signal_name.to_string(),
            id: Some(fill.id.clone()),
            symbol: symbol.to_string(),
            action,
            volume,
            open_price: Some(fill.price),
            state: OrderState::Open,
            pnl: previous.map_or(Decimal::ZERO, |closed| closed.pnl),
            close_price: None,
            timestamp: fill.timestamp,
            signal_interval: Some(signal_interval),
        },
    }
}

/// Consumes `signals`, submits market orders and persists the order rows.
pub struct OrderCoordinatorStage {
    subscriber: Box<dyn BusSubscriber>,
    store: Box<dyn OrderStore>,
    execution: Box<dyn ExecutionHandler>,
    volume: Decimal,
    poll_timeout: Duration,
}

impl OrderCoordinatorStage {
    #[must_use]
    pub fn new(
        subscriber: Box<dyn BusSubscriber>,
        store: Box<dyn OrderStore>,
        execution: Box<dyn ExecutionHandler>,
        volume: Decimal,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            subscriber,
            store,
            execution,
            volume,
            poll_timeout,
        }
    }

    async fn handle_signal(
        &mut self,
        signals: &SignalMap,
        signal_name: &str,
        action: OrderAction,
    ) -> Result<(), StageError> {
        // Lookup happens before submission so a redelivered signal is a no-op.
        let existing = self
            .store
            .fetch_order_by_signal(signal_name)
            .await
            .map_err(StageError::Storage)?;

        if let Some(applied) = existing.as_ref().and_then(|order| order.signal_interval) {
            if signals.interval_begin <= applied {
                tracing::debug!(
                    %signal_name,
                    interval_begin = %signals.interval_begin,
                    %applied,
                    "Signal already applied, skipping"
                );
                return Ok(());
            }
        }

        let volume = match &existing {
            Some(order) if order.state == OrderState::Open && order.action == action => {
                tracing::debug!(
                    %signal_name,
                    %action,
                    "Order already open in this direction, skipping"
                );
                return Ok(());
            }
            Some(order) if order.state == OrderState::Open => order.volume,
            _ => self.volume,
        };

        let request = OrderRequest {
            symbol: signals.symbol.clone(),
            action,
            volume,
            reference_price: Decimal::try_from(signals.close).ok(),
        };

        let fill = match self.execution.submit_order(&request).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::warn!(
                    %signal_name,
                    symbol = %request.symbol,
                    %action,
                    error = %format!("{e:#}"),
                    "Order rejected, skipping signal"
                );
                return Ok(());
            }
        };

        let order = next_order(
            existing,
            signal_name,
            &signals.symbol,
            action,
            volume,
            signals.interval_begin,
            &fill,
        );
        self.store
            .upsert_order(&order)
            .await
            .map_err(StageError::Storage)?;

        tracing::info!(
            %signal_name,
            symbol = %order.symbol,
            action = %order.action,
            state = order.state.as_str(),
            price = %fill.price,
            pnl = %order.pnl,
            "Order updated"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for OrderCoordinatorStage {
    fn name(&self) -> &str {
        crate::COORDINATE
    }

    async fn start(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    async fn step(&mut self) -> Result<StepOutcome, StageError> {
        let (record, signals) =
            match receive::<SignalMap>(self.subscriber.as_mut(), self.poll_timeout).await? {
                Received::Nothing => return Ok(StepOutcome::Idle),
                Received::Skipped => return Ok(StepOutcome::Processed),
                Received::Message(record, signals) => (record, signals),
            };

        for (strategy, signal) in &signals.signals {
            if let Some(action) = signal.action() {
                let signal_name = signals.order_key(strategy);
                self.handle_signal(&signals, &signal_name, action).await?;
            }
        }

        self.subscriber
            .ack(&record)
            .await
            .map_err(StageError::Bus)?;
        Ok(StepOutcome::Processed)
    }

    async fn close(&mut self) -> Result<(), StageError> {
        let subscriber = self.subscriber.close().await.map_err(StageError::Bus);
        let store = self.store.close().await.map_err(StageError::Storage);
        subscriber.and(store)
    }
}
