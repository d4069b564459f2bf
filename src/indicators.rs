/// Simple moving average; `None` until `w` values have been seen.
pub fn rolling_ma(x: &[f64], w: usize) -> Vec<Option<f64>> {
    if w == 0 {
        return vec![None; x.len()];
    }
    let mut out = vec![None; x.len()];
    let mut sum = 0.0;
    for i in 0..x.len() {
        sum += x[i];
        if i >= w {
            sum -= x[i - w];
        }
        if i + 1 >= w {
            out[i] = Some(sum / w as f64);
        }
    }
    out
}

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded with the
/// first observation without bias adjustment, so every bar has a value.
pub fn ema(x: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(x.len());
    let mut prev: Option<f64> = None;
    for &v in x {
        let next = match prev {
            None => v,
            Some(p) => alpha * v + (1.0 - alpha) * p,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// Index of the first bar where every series has a value.
pub fn first_defined(series: &[&[Option<f64>]]) -> Option<usize> {
    let len = series.iter().map(|s| s.len()).min()?;
    (0..len).find(|&i| series.iter().all(|s| s[i].is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_warms_up_then_averages() {
        let ma = rolling_ma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(ma, vec![None, None, Some(2.0), Some(3.0)]);
        assert_eq!(rolling_ma(&[1.0, 2.0], 0), vec![None, None]);
    }

    #[test]
    fn ema_is_seeded_with_first_value() {
        // alpha = 0.5
        let e = ema(&[10.0, 11.0, 12.0, 13.0], 3);
        assert_eq!(e, vec![10.0, 10.5, 11.25, 12.125]);
        assert!(ema(&[], 5).is_empty());
    }

    #[test]
    fn first_defined_index() {
        let a = rolling_ma(&[1.0, 2.0, 3.0, 4.0], 2);
        let b = rolling_ma(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(first_defined(&[&a, &b]), Some(2));
        assert_eq!(first_defined(&[&rolling_ma(&[1.0], 2)]), None);
    }
}
