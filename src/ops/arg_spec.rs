use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Window length, integer >= 1.
    Window,
    /// Lag in bars, integer >= 1.
    Lag,
    /// Any finite number.
    Real,
}

impl ParamKind {
    /// Validates a bound value, returning the reason on rejection.
    pub fn check(self, value: f64) -> Result<f64, &'static str> {
        if !value.is_finite() {
            return Err("must be finite");
        }
        match self {
            Self::Real => Ok(value),
            Self::Window | Self::Lag => positive_count(value).map(|n| n as f64),
        }
    }
}

/// Keyword parameter accepted by a catalog function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Option<f64>,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
        }
    }

    pub fn with_default(name: &str, kind: ParamKind, default: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: Some(default),
        }
    }
}

/// Static parameter descriptor used by the builtin native table.
#[derive(Debug, Clone, Copy)]
pub struct NativeParam {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl NativeParam {
    pub(crate) fn to_spec(self) -> ParamSpec {
        ParamSpec::required(self.name, self.kind)
    }
}

#[inline]
pub fn positive_count(value: f64) -> Result<usize, &'static str> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err("must be an integer");
    }
    if value < 1.0 {
        return Err("must be >= 1");
    }
    if value > u32::MAX as f64 {
        return Err("is too large");
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_requires_positive_integer() {
        assert_eq!(ParamKind::Window.check(5.0), Ok(5.0));
        assert!(ParamKind::Window.check(0.0).is_err());
        assert!(ParamKind::Window.check(2.5).is_err());
        assert!(ParamKind::Window.check(-3.0).is_err());
    }

    #[test]
    fn lag_shares_window_rules() {
        assert_eq!(positive_count(1.0), Ok(1));
        assert!(ParamKind::Lag.check(f64::NAN).is_err());
    }

    #[test]
    fn real_accepts_any_finite_value() {
        assert_eq!(ParamKind::Real.check(-0.25), Ok(-0.25));
        assert!(ParamKind::Real.check(f64::INFINITY).is_err());
    }
}
