/// Average Directional Index (ADX) with +DI / -DI
///
/// - ADX > 25: strong trend
/// - ADX 20-25: developing trend
/// - ADX < 20: ranging market
///
/// +DI above -DI means buyers control the move, and the reverse for sellers.
use crate::models::TrendCandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxReading {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Calculate ADX, +DI and -DI over the candle series.
///
/// +DM, -DM and True Range are smoothed with Wilder's running average
/// (seeded with the mean of the first `period` samples). The reported ADX is
/// the latest DX value, a single-sample approximation rather than a further
/// Wilder-smoothed average of DX.
///
/// Returns None with fewer than `period + 1` candles.
pub fn calculate_adx(candles: &[TrendCandle], period: usize) -> Option<AdxReading> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        true_ranges.push(tr);

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dms.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dms.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let smoothed_tr = wilder_smooth(&true_ranges, period)?;
    let smoothed_plus_dm = wilder_smooth(&plus_dms, period)?;
    let smoothed_minus_dm = wilder_smooth(&minus_dms, period)?;

    let (plus_di, minus_di) = if smoothed_tr > 0.0 {
        (
            100.0 * smoothed_plus_dm / smoothed_tr,
            100.0 * smoothed_minus_dm / smoothed_tr,
        )
    } else {
        (0.0, 0.0)
    };

    let di_sum = plus_di + minus_di;
    let dx = if di_sum > 0.0 {
        100.0 * (plus_di - minus_di).abs() / di_sum
    } else {
        0.0
    };

    Some(AdxReading {
        adx: dx,
        plus_di,
        minus_di,
    })
}

/// Wilder's running moving average (RMA): mean of the first `period`
/// values, then `(prev * (period - 1) + value) / period`.
pub fn wilder_smooth(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let p = period as f64;
    let seed = values[..period].iter().sum::<f64>() / p;

    Some(
        values[period..]
            .iter()
            .fold(seed, |smoothed, value| (smoothed * (p - 1.0) + value) / p),
    )
}
