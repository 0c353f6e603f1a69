use crate::ops::Slot;
use crate::plan::KernelParam;
use crate::state::KernelState;
use crate::types::SkipReason;

#[inline]
fn finite_or_skip(value: f64) -> Slot {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SkipReason::NonFinite)
    }
}

#[inline]
fn binary(inputs: &[Slot]) -> Result<(f64, f64), SkipReason> {
    Ok((inputs[0]?, inputs[1]?))
}

pub fn elem_add(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (lhs, rhs) = binary(inputs)?;
    finite_or_skip(lhs + rhs)
}

pub fn elem_sub(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (lhs, rhs) = binary(inputs)?;
    finite_or_skip(lhs - rhs)
}

pub fn elem_mul(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (lhs, rhs) = binary(inputs)?;
    finite_or_skip(lhs * rhs)
}

pub fn elem_div(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (lhs, rhs) = binary(inputs)?;
    if rhs == 0.0 {
        return Err(SkipReason::DivisionByZero);
    }
    finite_or_skip(lhs / rhs)
}

pub fn elem_pow(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (base, exp) = binary(inputs)?;
    if base < 0.0 && exp.fract() != 0.0 {
        return Err(SkipReason::DomainError);
    }
    if base == 0.0 && exp < 0.0 {
        return Err(SkipReason::DivisionByZero);
    }
    finite_or_skip(base.powf(exp))
}

pub fn elem_neg(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    Ok(-inputs[0]?)
}

pub fn elem_abs(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    Ok(inputs[0]?.abs())
}

pub fn elem_max(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (lhs, rhs) = binary(inputs)?;
    Ok(lhs.max(rhs))
}

pub fn elem_min(_state: &mut KernelState, inputs: &[Slot], _p: KernelParam) -> Slot {
    let (lhs, rhs) = binary(inputs)?;
    Ok(lhs.min(rhs))
}
