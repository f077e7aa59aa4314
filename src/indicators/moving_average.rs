/// Simple moving average of the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average over a span.
///
/// Seeded with the first value and run over the whole series with
/// `alpha = 2 / (span + 1)`, i.e. the non-adjusted recursive form
/// `ema = alpha * x + (1 - alpha) * ema`.
pub fn calculate_ema(values: &[f64], span: usize) -> Option<f64> {
    if span == 0 || values.is_empty() {
        return None;
    }

    let alpha = 2.0 / (span as f64 + 1.0);
    let mut iter = values.iter();
    let mut ema = *iter.next()?;
    for value in iter {
        ema = alpha * value + (1.0 - alpha) * ema;
    }

    Some(ema)
}

/// Trend line: mean of the EMA and SMA of the same period
pub fn trend_line(values: &[f64], period: usize) -> Option<f64> {
    let ema = calculate_ema(values, period)?;
    let sma = calculate_sma(values, period)?;
    Some((ema + sma) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_uses_latest_window() {
        let values = vec![1.0, 100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&values, 5), Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert!(calculate_sma(&[100.0, 102.0], 5).is_none());
        assert!(calculate_sma(&[100.0], 0).is_none());
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        // span 3 -> alpha 0.5
        let ema = calculate_ema(&[10.0, 20.0, 30.0], 3).unwrap();
        // 10 -> 15 -> 22.5
        assert!((ema - 22.5).abs() < 1e-12);
    }

    #[test]
    fn test_ema_single_value() {
        assert_eq!(calculate_ema(&[42.0], 9), Some(42.0));
        assert!(calculate_ema(&[], 9).is_none());
    }

    #[test]
    fn test_trend_line_flat_series() {
        let values = vec![250.0; 20];
        let line = trend_line(&values, 9).unwrap();
        assert!((line - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_trend_line_lags_rising_series() {
        let values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let line = trend_line(&values, 9).unwrap();
        assert!(line < 119.0);
        assert!(line > 110.0);
    }
}
