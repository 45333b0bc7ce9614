//! Risk adjustment: maps a master trade + account configuration + feature
//! toggles into an adjusted slave order.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::RiskError;
use crate::models::{Account, AdjustedOrder, FeatureConfig, MasterTrade, TradeSide};

const MAX_RISK_MULTIPLIER: Decimal = dec!(10);

/// Price increment for one point, keyed by symbol.
///
/// JPY-quoted pairs use 3-decimal quoting (point = 0.001); 5-decimal majors
/// use 0.00001. Unknown symbols fall back to the 5-decimal point value. The
/// table is a fixed policy kept compatible with existing audit records; do
/// not derive it from venue metadata.
pub fn point_value(symbol: &str) -> Decimal {
    match symbol {
        "USDJPY" | "EURJPY" | "GBPJPY" | "AUDJPY" | "NZDJPY" | "CADJPY" | "CHFJPY" => dec!(0.001),
        "EURUSD" | "GBPUSD" | "AUDUSD" | "NZDUSD" | "USDCHF" | "USDCAD" | "EURGBP" | "EURCHF"
        | "EURAUD" | "GBPCHF" => dec!(0.00001),
        _ => dec!(0.00001),
    }
}

/// Compute the adjusted order for one slave account.
///
/// Pure: no I/O, no clock. Rejects (never clamps) a risk multiplier outside
/// (0, 10], so a misconfigured account can never produce a zero or negative
/// volume order.
pub fn adjust(
    trade: &MasterTrade,
    account: &Account,
    features: &FeatureConfig,
) -> Result<AdjustedOrder, RiskError> {
    let multiplier = account.risk_multiplier;
    if multiplier <= Decimal::ZERO || multiplier > MAX_RISK_MULTIPLIER {
        return Err(RiskError::MultiplierOutOfRange(multiplier));
    }

    let point = point_value(&trade.symbol);

    let take_profit = features.enable_take_profit.then(|| {
        let offset = Decimal::from(features.take_profit_points) * point;
        match trade.side {
            TradeSide::Buy => trade.price + offset,
            TradeSide::Sell => trade.price - offset,
        }
    });

    let stop_loss = features.enable_stop_loss.then(|| {
        let offset = Decimal::from(features.stop_loss_points) * point;
        match trade.side {
            TradeSide::Buy => trade.price - offset,
            TradeSide::Sell => trade.price + offset,
        }
    });

    let trailing_stop = features
        .enable_trailing_stop
        .then_some(features.trailing_stop_points);

    Ok(AdjustedOrder {
        symbol: trade.symbol.clone(),
        side: trade.side,
        volume: trade.volume * multiplier,
        price: trade.price,
        take_profit,
        stop_loss,
        trailing_stop,
        max_slippage: features.max_slippage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn master_trade(symbol: &str, side: TradeSide, volume: Decimal, price: Decimal) -> MasterTrade {
        MasterTrade {
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            occurred_at: Utc::now(),
        }
    }

    fn slave(multiplier: Decimal) -> Account {
        Account {
            id: 2,
            name: "slave".to_string(),
            platform: crate::models::Platform::MetaTrader,
            is_master: false,
            is_active: true,
            risk_multiplier: multiplier,
            conflict_policy: crate::models::ConflictPolicy::AllowBoth,
            allow_manual_trading: true,
        }
    }

    #[test]
    fn volume_scales_by_risk_multiplier() {
        let trade = master_trade("EURUSD", TradeSide::Buy, dec!(1.0), dec!(1.0850));
        let features = FeatureConfig::default();

        for multiplier in [dec!(0.01), dec!(0.5), dec!(1), dec!(2.5), dec!(10)] {
            let order = adjust(&trade, &slave(multiplier), &features).unwrap();
            assert_eq!(order.volume, dec!(1.0) * multiplier);
        }
    }

    #[test]
    fn multiplier_outside_range_is_rejected() {
        let trade = master_trade("EURUSD", TradeSide::Buy, dec!(1.0), dec!(1.0850));
        let features = FeatureConfig::default();

        for bad in [dec!(0), dec!(-1), dec!(10.01), dec!(100)] {
            let err = adjust(&trade, &slave(bad), &features).unwrap_err();
            assert_eq!(err, RiskError::MultiplierOutOfRange(bad));
        }
    }

    #[test]
    fn take_profit_adds_points_for_buy_and_subtracts_for_sell() {
        let features = FeatureConfig {
            enable_take_profit: true,
            take_profit_points: 100,
            ..Default::default()
        };

        let buy = master_trade("EURUSD", TradeSide::Buy, dec!(1.0), dec!(1.0850));
        let order = adjust(&buy, &slave(dec!(1)), &features).unwrap();
        assert_eq!(order.take_profit, Some(dec!(1.08600)));

        let sell = master_trade("EURUSD", TradeSide::Sell, dec!(1.0), dec!(1.0850));
        let order = adjust(&sell, &slave(dec!(1)), &features).unwrap();
        assert_eq!(order.take_profit, Some(dec!(1.08400)));
    }

    #[test]
    fn stop_loss_has_inverted_sign() {
        let features = FeatureConfig {
            enable_stop_loss: true,
            stop_loss_points: 50,
            ..Default::default()
        };

        let buy = master_trade("EURUSD", TradeSide::Buy, dec!(1.0), dec!(1.0850));
        let order = adjust(&buy, &slave(dec!(1)), &features).unwrap();
        assert_eq!(order.stop_loss, Some(dec!(1.08450)));

        let sell = master_trade("EURUSD", TradeSide::Sell, dec!(1.0), dec!(1.0850));
        let order = adjust(&sell, &slave(dec!(1)), &features).unwrap();
        assert_eq!(order.stop_loss, Some(dec!(1.08550)));
    }

    #[test]
    fn jpy_pairs_use_three_decimal_point() {
        let features = FeatureConfig {
            enable_take_profit: true,
            take_profit_points: 100,
            ..Default::default()
        };

        let trade = master_trade("USDJPY", TradeSide::Buy, dec!(1.0), dec!(149.50));
        let order = adjust(&trade, &slave(dec!(1)), &features).unwrap();
        assert_eq!(order.take_profit, Some(dec!(149.600)));
    }

    #[test]
    fn unknown_symbols_default_to_five_decimal_point() {
        assert_eq!(point_value("XAUUSD"), dec!(0.00001));
        assert_eq!(point_value("BTCUSD"), dec!(0.00001));
    }

    #[test]
    fn half_size_buy_with_take_profit_scenario() {
        // Master trade EURUSD BUY 1.0 @ 1.0850, multiplier 0.5, TP 100 points.
        let features = FeatureConfig {
            enable_take_profit: true,
            take_profit_points: 100,
            ..Default::default()
        };
        let trade = master_trade("EURUSD", TradeSide::Buy, dec!(1.0), dec!(1.0850));

        let order = adjust(&trade, &slave(dec!(0.5)), &features).unwrap();
        assert_eq!(order.volume, dec!(0.50));
        assert_eq!(order.take_profit, Some(dec!(1.08600)));
        assert_eq!(order.stop_loss, None);
    }

    #[test]
    fn disabled_features_leave_levels_unset() {
        let trade = master_trade("EURUSD", TradeSide::Buy, dec!(1.0), dec!(1.0850));
        let order = adjust(&trade, &slave(dec!(1)), &FeatureConfig::default()).unwrap();
        assert_eq!(order.take_profit, None);
        assert_eq!(order.stop_loss, None);
        assert_eq!(order.trailing_stop, None);
    }

    #[test]
    fn trailing_stop_passes_points_through() {
        let features = FeatureConfig {
            enable_trailing_stop: true,
            trailing_stop_points: 30,
            ..Default::default()
        };
        let trade = master_trade("EURUSD", TradeSide::Sell, dec!(2.0), dec!(1.0850));
        let order = adjust(&trade, &slave(dec!(1)), &features).unwrap();
        assert_eq!(order.trailing_stop, Some(30));
    }
}
