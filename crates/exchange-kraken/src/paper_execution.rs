use algo_pipeline_core::{ExecutionHandler, OrderAction, OrderFill, OrderRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

/// Paper trading execution handler.
///
/// Makes **zero API calls** to the exchange. Market orders fill at the
/// request's reference price moved against the trader by `slippage_bps`.
pub struct PaperExecutionHandler {
    slippage_bps: Decimal,
}

impl PaperExecutionHandler {
    /// # Errors
    /// Returns an error if `slippage_bps` is not a finite number.
    pub fn new(slippage_bps: f64) -> Result<Self> {
        let slippage_bps = Decimal::try_from(slippage_bps)
            .with_context(|| format!("Invalid slippage: {slippage_bps}"))?;
        Ok(Self { slippage_bps })
    }

    fn apply_slippage(&self, price: Decimal, action: OrderAction) -> Decimal {
        let slippage = price * self.slippage_bps / Decimal::from(10_000);
        match action {
            OrderAction::Buy => price + slippage,
            OrderAction::Sell => price - slippage,
        }
    }
}

#[async_trait]
impl ExecutionHandler for PaperExecutionHandler {
    async fn submit_order(&mut self, request: &OrderRequest) -> Result<OrderFill> {
        let reference = request.reference_price.with_context(|| {
            format!(
                "Paper {} order for {} has no reference price",
                request.action, request.symbol
            )
        })?;

        let fill = OrderFill {
            id: format!("PAPER-{}", uuid::Uuid::new_v4()),
            price: self.apply_slippage(reference, request.action),
            timestamp: Utc::now(),
        };

        tracing::info!(
            symbol = %request.symbol,
            action = %request.action,
            volume = %request.volume,
            price = %fill.price,
            id = %fill.id,
            "Paper order filled"
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(action: OrderAction, price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USD".to_string(),
            action,
            volume: dec!(1),
            reference_price: price,
        }
    }

    #[tokio::test]
    async fn test_slippage_moves_against_the_trader() {
        let mut handler = PaperExecutionHandler::new(10.0).unwrap();

        let buy = handler
            .submit_order(&request(OrderAction::Buy, Some(dec!(50000))))
            .await
            .unwrap();
        let sell = handler
            .submit_order(&request(OrderAction::Sell, Some(dec!(50000))))
            .await
            .unwrap();

        assert_eq!(buy.price, dec!(50050));
        assert_eq!(sell.price, dec!(49950));
        assert!(buy.id.starts_with("PAPER-"));
        assert_ne!(buy.id, sell.id);
    }

    #[tokio::test]
    async fn test_zero_slippage_fills_at_reference() {
        let mut handler = PaperExecutionHandler::new(0.0).unwrap();
        let fill = handler
            .submit_order(&request(OrderAction::Buy, Some(dec!(100.25))))
            .await
            .unwrap();
        assert_eq!(fill.price, dec!(100.25));
    }

    #[tokio::test]
    async fn test_missing_reference_price_is_rejected() {
        let mut handler = PaperExecutionHandler::new(0.0).unwrap();
        assert!(handler
            .submit_order(&request(OrderAction::Sell, None))
            .await
            .is_err());
    }

    #[test]
    fn test_non_finite_slippage_is_rejected() {
        assert!(PaperExecutionHandler::new(f64::NAN).is_err());
    }
}
