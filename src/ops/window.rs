use crate::ops::Slot;
use crate::plan::KernelParam;
use crate::state::{KernelState, SmootherState, WindowState};
use crate::types::SkipReason;

#[inline]
fn window_state(state: &mut KernelState) -> &mut WindowState {
    match state {
        KernelState::Window(window) => window,
        other => unreachable!("window kernel bound to {other:?}"),
    }
}

#[inline]
fn smoother_state(state: &mut KernelState) -> &mut SmootherState {
    match state {
        KernelState::Smoother(smoother) => smoother,
        other => unreachable!("smoother kernel bound to {other:?}"),
    }
}

/// Feeds one input into a full-window reducer. Returns the skip reason while
/// the window is not yet usable.
///
/// Leading warm-up nulls of the input are not pushed, so a window over a
/// still-warming input reports `InsufficientLookback` rather than `NullInput`.
#[inline]
fn feed(window: &mut WindowState, input: Slot) -> Option<SkipReason> {
    match input {
        Err(SkipReason::InsufficientLookback) if window.ring().is_empty() => {
            return Some(SkipReason::InsufficientLookback);
        }
        Ok(value) => window.push(Some(value)),
        Err(_) => window.push(None),
    }
    if !window.is_full() {
        return Some(SkipReason::InsufficientLookback);
    }
    if window.nulls() > 0 {
        return Some(SkipReason::NullInput);
    }
    None
}

pub fn win_sma(state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let window = window_state(state);
    if let Some(reason) = feed(window, inputs[0]) {
        return Err(reason);
    }
    Ok(window.sum() / window.ring().cap() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn win_stdev(state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let window = window_state(state);
    if let Some(reason) = feed(window, inputs[0]) {
        return Err(reason);
    }
    let n = window.ring().cap();
    if n < 2 {
        return Err(SkipReason::DomainError);
    }
    let mean = window.sum() / n as f64;
    let sq: f64 = window.ring().iter().map(|v| (v - mean) * (v - mean)).sum();
    Ok((sq / (n - 1) as f64).sqrt())
}

pub fn win_rolling_max(state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let window = window_state(state);
    if let Some(reason) = feed(window, inputs[0]) {
        return Err(reason);
    }
    Ok(window.ring().iter().fold(f64::NEG_INFINITY, f64::max))
}

pub fn win_rolling_min(state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let window = window_state(state);
    if let Some(reason) = feed(window, inputs[0]) {
        return Err(reason);
    }
    Ok(window.ring().iter().fold(f64::INFINITY, f64::min))
}

pub fn win_diff(state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let window = window_state(state);
    if let Some(reason) = feed(window, inputs[0]) {
        return Err(reason);
    }
    match (window.ring().get_lag(0), window.ring().get_lag(1)) {
        (Some(cur), Some(prev)) => Ok(cur - prev),
        _ => Err(SkipReason::InsufficientLookback),
    }
}

/// `x[t - n]`; only the shifted point itself has to be non-null.
pub fn win_shift(state: &mut KernelState, inputs: &[Slot], p: KernelParam) -> Slot {
    let lag = p.count().unwrap_or(1);
    let window = window_state(state);
    match inputs[0] {
        Err(SkipReason::InsufficientLookback) if window.ring().is_empty() => {
            return Err(SkipReason::InsufficientLookback);
        }
        Ok(value) => window.push(Some(value)),
        Err(_) => window.push(None),
    }
    match window.ring().get_lag(lag) {
        None => Err(SkipReason::InsufficientLookback),
        Some(value) if value.is_nan() => Err(SkipReason::NullInput),
        Some(value) => Ok(value),
    }
}

#[inline]
fn smooth(smoother: &mut SmootherState, value: f64, alpha: f64) -> f64 {
    let next = match smoother.value {
        None => value,
        Some(prev) => alpha * value + (1.0 - alpha) * prev,
    };
    smoother.value = Some(next);
    smoother.seen += 1;
    next
}

/// Exponential moving average with `alpha = 2 / (period + 1)`, seeded with the
/// first valid input. A null input leaves the average untouched.
pub fn win_ema(state: &mut KernelState, inputs: &[Slot], p: KernelParam) -> Slot {
    let period = p.count().unwrap_or(1) as f64;
    let smoother = smoother_state(state);
    let value = inputs[0]?;
    Ok(smooth(smoother, value, 2.0 / (period + 1.0)))
}

/// Wilder smoothing (`alpha = 1 / period`); null until `period` valid inputs were seen.
pub fn win_wilder(state: &mut KernelState, inputs: &[Slot], p: KernelParam) -> Slot {
    let period = p.count().unwrap_or(1);
    let smoother = smoother_state(state);
    let value = inputs[0]?;
    let out = smooth(smoother, value, 1.0 / period as f64);
    if smoother.seen < period {
        return Err(SkipReason::InsufficientLookback);
    }
    Ok(out)
}

pub fn win_cumsum(state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let KernelState::Running { sum } = state else {
        unreachable!("cumsum kernel bound to a non-running state");
    };
    let value = inputs[0]?;
    *sum += value;
    Ok(*sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Kernel, StateSpec};

    fn run_series(
        kernel: Kernel,
        spec: StateSpec,
        history: usize,
        p: KernelParam,
        xs: &[Slot],
    ) -> Vec<Slot> {
        let mut state = KernelState::for_step(spec, history);
        xs.iter()
            .map(|x| kernel(&mut state, std::slice::from_ref(x), p))
            .collect()
    }

    fn ok(xs: &[f64]) -> Vec<Slot> {
        xs.iter().map(|x| Ok(*x)).collect()
    }

    #[test]
    fn sma_emits_period_minus_one_leading_nulls() {
        let out = run_series(
            win_sma,
            StateSpec::Window,
            3,
            KernelParam::Window(3),
            &ok(&[1.0, 2.0, 3.0, 4.0]),
        );
        assert_eq!(
            out,
            vec![
                Err(SkipReason::InsufficientLookback),
                Err(SkipReason::InsufficientLookback),
                Ok(2.0),
                Ok(3.0)
            ]
        );
    }

    #[test]
    fn sma_over_window_with_null_is_null_until_it_leaves() {
        let xs = vec![Ok(1.0), Err(SkipReason::DivisionByZero), Ok(3.0), Ok(5.0)];
        let out = run_series(win_sma, StateSpec::Window, 2, KernelParam::Window(2), &xs);
        assert_eq!(out[1], Err(SkipReason::NullInput));
        assert_eq!(out[2], Err(SkipReason::NullInput));
        assert_eq!(out[3], Ok(4.0));
    }

    #[test]
    fn nested_window_skips_upstream_warmup() {
        let xs = vec![Err(SkipReason::InsufficientLookback), Ok(2.0), Ok(4.0)];
        let out = run_series(win_sma, StateSpec::Window, 2, KernelParam::Window(2), &xs);
        assert_eq!(out[1], Err(SkipReason::InsufficientLookback));
        assert_eq!(out[2], Ok(3.0));
    }

    #[test]
    fn stdev_is_sample_standard_deviation() {
        let out = run_series(
            win_stdev,
            StateSpec::Window,
            4,
            KernelParam::Window(4),
            &ok(&[2.0, 4.0, 4.0, 6.0]),
        );
        let expected = (8.0_f64 / 3.0).sqrt();
        match out[3] {
            Ok(v) => assert!((v - expected).abs() < 1e-12),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ema_seeds_with_first_value_and_has_no_warmup() {
        let out = run_series(
            win_ema,
            StateSpec::Smoother,
            1,
            KernelParam::Window(3),
            &ok(&[1.0, 3.0, 5.0]),
        );
        assert_eq!(out, vec![Ok(1.0), Ok(2.0), Ok(3.5)]);
    }

    #[test]
    fn wilder_waits_for_period_valid_points() {
        let out = run_series(
            win_wilder,
            StateSpec::Smoother,
            1,
            KernelParam::Window(2),
            &ok(&[2.0, 4.0, 8.0]),
        );
        assert_eq!(out[0], Err(SkipReason::InsufficientLookback));
        assert_eq!(out[1], Ok(3.0));
        assert_eq!(out[2], Ok(5.5));
    }

    #[test]
    fn shift_and_diff_look_back_exactly() {
        let shifted = run_series(
            win_shift,
            StateSpec::Window,
            3,
            KernelParam::Lag(2),
            &ok(&[1.0, 2.0, 3.0, 4.0]),
        );
        assert_eq!(shifted[1], Err(SkipReason::InsufficientLookback));
        assert_eq!(shifted[2], Ok(1.0));
        assert_eq!(shifted[3], Ok(2.0));

        let diffs = run_series(
            win_diff,
            StateSpec::Window,
            2,
            KernelParam::None,
            &ok(&[1.0, 4.0, 9.0]),
        );
        assert_eq!(diffs, vec![Err(SkipReason::InsufficientLookback), Ok(3.0), Ok(5.0)]);
    }

    #[test]
    fn cumsum_skips_nulls_but_keeps_running_total() {
        let xs = vec![Ok(1.0), Err(SkipReason::NullInput), Ok(2.0)];
        let out = run_series(win_cumsum, StateSpec::Running, 1, KernelParam::None, &xs);
        assert_eq!(out, vec![Ok(1.0), Err(SkipReason::NullInput), Ok(3.0)]);
    }
}
