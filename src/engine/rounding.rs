use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};
use crate::models::order::OrderSide;

/// Decimal places allowed per field for a given tick size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundConfig {
    pub price: u32,
    pub size: u32,
    pub amount: u32,
}

/// Tick-size table. Any other tick size is a validation error.
pub fn round_config_for_tick(tick: Decimal) -> Option<RoundConfig> {
    let table = [
        (Decimal::new(1, 1), RoundConfig { price: 1, size: 2, amount: 3 }),
        (Decimal::new(1, 2), RoundConfig { price: 2, size: 2, amount: 4 }),
        (Decimal::new(1, 3), RoundConfig { price: 3, size: 2, amount: 5 }),
        (Decimal::new(1, 4), RoundConfig { price: 4, size: 2, amount: 6 }),
    ];
    table.iter().find(|(t, _)| *t == tick).map(|(_, c)| *c)
}

pub fn round_down(x: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    // Nudge before flooring so values that are exact in decimal but sit just
    // below an integer in binary (0.29 * 100 = 28.999…) do not lose a unit.
    ((x * factor) + 1e-9).floor() / factor
}

pub fn round_up(x: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    ((x * factor) - 1e-9).ceil() / factor
}

pub fn round_normal(x: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (x * factor).round() / factor
}

/// Count decimal places, up to a cap of 9.
pub fn decimal_places(x: f64) -> u32 {
    for n in 0..=9u32 {
        let scaled = x * 10f64.powi(n as i32);
        if (scaled - scaled.round()).abs() < 1e-7 {
            return n;
        }
    }
    9
}

/// Convert a rounded decimal value to 1e6 base units.
pub fn to_base_units(x: f64) -> u64 {
    (x * 1_000_000.0).round() as u64
}

/// Compute signable (maker, taker) base-unit amounts for a limit order.
///
/// BUY: taker = tokens rounded down to size decimals; maker = collateral,
/// refined up then down when the raw product carries too many decimals.
/// SELL: maker = tokens rounded down; taker = collateral rounded down.
pub fn order_amounts(
    side: OrderSide,
    size: f64,
    price: f64,
    config: RoundConfig,
) -> (u64, u64) {
    match side {
        OrderSide::Buy => {
            let raw_taker = round_down(size, config.size);
            let mut raw_maker = raw_taker * price;
            if decimal_places(raw_maker) > config.amount {
                raw_maker = round_up(raw_maker, config.amount + 4);
                if decimal_places(raw_maker) > config.amount {
                    raw_maker = round_down(raw_maker, config.amount);
                }
            }
            (to_base_units(raw_maker), to_base_units(raw_taker))
        }
        OrderSide::Sell => {
            let raw_maker = round_down(size, config.size);
            let mut raw_taker = raw_maker * price;
            if decimal_places(raw_taker) > config.amount {
                raw_taker = round_down(raw_taker, config.amount);
            }
            (to_base_units(raw_maker), to_base_units(raw_taker))
        }
    }
}

/// FOK/FAK inputs must be exactly representable: price in cents, size in
/// 1e-4 tokens, and their product in cents.
pub fn validate_fok_precision(price: f64, size: f64) -> EngineResult<()> {
    let checks = [
        ("price", price * 100.0),
        ("size", size * 10_000.0),
        ("notional", price * size * 100.0),
    ];
    for (field, scaled) in checks {
        if (scaled - scaled.round()).abs() > 1e-6 {
            return Err(EngineError::Validation(format!(
                "{field} not exactly representable for FOK/FAK: price={price} size={size}"
            )));
        }
    }
    Ok(())
}

/// Minimum collateral notional; applies to every order.
pub fn validate_min_order(price: f64, size: f64, min_order_size: f64) -> EngineResult<()> {
    let notional = price * size;
    if notional + 1e-9 < min_order_size {
        return Err(EngineError::Validation(format!(
            "order notional {notional:.4} below minimum {min_order_size}"
        )));
    }
    Ok(())
}

/// Minimum token count; GTC only.
pub fn validate_min_shares(size: f64, min_share_size: f64) -> EngineResult<()> {
    if size + 1e-9 < min_share_size {
        return Err(EngineError::Validation(format!(
            "order size {size} below minimum share size {min_share_size}"
        )));
    }
    Ok(())
}

/// Fingerprint quanta: cents for price, 1e-4 tokens for size.
pub fn price_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

pub fn size_quanta(size: f64) -> u64 {
    (size * 10_000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_normal_is_idempotent() {
        for x in [0.123456, 0.5, 0.999, 17.777777, 0.0001] {
            for n in 0..=6 {
                let once = round_normal(x, n);
                assert_eq!(round_normal(once, n), once, "x={x} n={n}");
            }
        }
    }

    #[test]
    fn round_down_handles_binary_artifacts() {
        // 0.29 * 100 = 28.999999999999996 in f64
        assert_eq!(round_down(0.29, 2), 0.29);
        assert_eq!(round_down(0.295, 2), 0.29);
        assert_eq!(round_up(0.291, 2), 0.30);
    }

    #[test]
    fn tick_table_rejects_unknown() {
        assert!(round_config_for_tick(Decimal::new(1, 2)).is_some());
        assert!(round_config_for_tick(Decimal::new(5, 2)).is_none());
        let c = round_config_for_tick(Decimal::new(1, 4)).unwrap();
        assert_eq!(c, RoundConfig { price: 4, size: 2, amount: 6 });
    }

    #[test]
    fn buy_amounts_round_taker_down() {
        let config = round_config_for_tick(Decimal::new(1, 2)).unwrap();
        // size truncated to 2 decimals: 10.1234 -> 10.12 tokens
        let (maker, taker) = order_amounts(OrderSide::Buy, 10.1234, 0.55, config);
        assert_eq!(taker, 10_120_000);
        // 10.12 * 0.55 = 5.566 -> exactly representable at 4 decimals
        assert_eq!(maker, 5_566_000);
    }

    #[test]
    fn buy_maker_refinement_caps_decimals() {
        let config = round_config_for_tick(Decimal::new(1, 2)).unwrap();
        // 3.33 * 0.333333 has > 4 decimals; refined up then down
        let (maker, _taker) = order_amounts(OrderSide::Buy, 3.33, 0.333333, config);
        // maker must land on a 4-decimal boundary in base units
        assert_eq!(maker % 100, 0);
    }

    #[test]
    fn sell_amounts_round_both_down() {
        let config = round_config_for_tick(Decimal::new(1, 2)).unwrap();
        let (maker, taker) = order_amounts(OrderSide::Sell, 7.999, 0.333333, config);
        assert_eq!(maker, 7_990_000); // 7.99 tokens
        // 7.99 * 0.333333 = 2.66333... -> 2.6633 at 4 decimals
        assert_eq!(taker, 2_663_300);
    }

    #[test]
    fn fok_guard_accepts_exact_inputs() {
        validate_fok_precision(0.55, 10.0).unwrap();
        validate_fok_precision(0.61, 4.0).unwrap();
    }

    #[test]
    fn fok_guard_rejects_inexact_inputs() {
        // price=0.555 -> price*100 = 55.5
        assert!(validate_fok_precision(0.555, 1.2345).is_err());
        // size with 5 decimals
        assert!(validate_fok_precision(0.55, 1.00001).is_err());
    }

    #[test]
    fn minimums() {
        assert!(validate_min_order(0.50, 1.0, 1.0).is_err());
        validate_min_order(0.50, 2.0, 1.0).unwrap();
        assert!(validate_min_shares(4.0, 5.0).is_err());
        validate_min_shares(5.0, 5.0).unwrap();
    }

    #[test]
    fn fingerprint_quanta() {
        assert_eq!(price_cents(0.55), 55);
        assert_eq!(size_quanta(10.1234), 101_234);
    }
}
