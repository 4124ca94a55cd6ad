//! The temporal half of a deformation component.
//!
//! A [TimeModel] is one of four analytic shapes - secular velocity, step,
//! ramp, exponential decay - evaluated as a scale factor at an instant.
//! [TimeFunction] wraps a time model with the valid date range from the
//! component definition, composes the factor for a `(date, baseDate)` pair,
//! and memoises the result: the overwhelmingly common usage is many points
//! at one date, or a time series at one point.
//!
//! All times are UTC; a model year is 365.2425 days.

use crate::time::Time;
use crate::Error;
use log::trace;

const DAYS_IN_YEAR: f64 = 365.2425;

/// An analytic time model shape with its validated parameters
#[derive(Clone, Debug, PartialEq)]
pub enum TimeModel {
    /// Linear in years since the reference time
    Velocity { time0: Time },
    /// `factor0` strictly before `time0`, `factor1` from `time0` on
    Step {
        time0: Time,
        factor0: f64,
        factor1: f64,
    },
    /// Linear blend from `(time0, factor0)` to `(time1, factor1)`
    Ramp {
        time0: Time,
        time1: Time,
        factor0: f64,
        factor1: f64,
        // Slope in factor units per day; zero for a degenerate ramp
        velocity: f64,
    },
    /// Exponential relaxation from `factor0` towards `factor1`
    Decay {
        time0: Time,
        time1: Option<Time>,
        factor0: f64,
        factor1: f64,
        decay: f64,
        // factor1 - factor0, rescaled when time1 pins the endpoint
        fdif: f64,
    },
}

impl TimeModel {
    /// Build and validate a time model from the component definition fields
    pub fn new(
        kind: &str,
        factor0: Option<f64>,
        time0: Option<Time>,
        factor1: Option<f64>,
        time1: Option<Time>,
        decay: Option<f64>,
    ) -> Result<TimeModel, Error> {
        match kind {
            "velocity" => {
                let time0 = time0.ok_or_else(|| {
                    Error::Definition("Reference time missing for velocity time model".to_string())
                })?;
                Ok(TimeModel::Velocity { time0 })
            }

            "step" => {
                let time0 = time0.ok_or_else(|| {
                    Error::Definition("Reference time missing for step time model".to_string())
                })?;
                let (factor0, factor1) = both_factors(factor0, factor1, "step")?;
                Ok(TimeModel::Step {
                    time0,
                    factor0,
                    factor1,
                })
            }

            "ramp" => {
                let (Some(time0), Some(time1)) = (time0, time1) else {
                    return Err(Error::Definition(
                        "Reference time missing for ramp time model".to_string(),
                    ));
                };
                if time0 > time1 {
                    return Err(Error::Definition(
                        "End time before start time for ramp time model".to_string(),
                    ));
                }
                let (factor0, factor1) = both_factors(factor0, factor1, "ramp")?;
                let velocity = if time1 > time0 {
                    (factor1 - factor0) / time1.days_after(time0)
                } else {
                    0.0
                };
                Ok(TimeModel::Ramp {
                    time0,
                    time1,
                    factor0,
                    factor1,
                    velocity,
                })
            }

            "decay" => {
                let time0 = time0.ok_or_else(|| {
                    Error::Definition("Reference time missing for decay time model".to_string())
                })?;
                if let Some(t1) = time1 {
                    if time0 > t1 {
                        return Err(Error::Definition(
                            "End time before start time for decay time model".to_string(),
                        ));
                    }
                }
                let (factor0, factor1) = both_factors(factor0, factor1, "decay")?;
                let decay = match decay {
                    Some(d) if d > 0.0 => d,
                    _ => {
                        return Err(Error::Definition(
                            "Decay rate missing or not greater than 0 for decay time model"
                                .to_string(),
                        ))
                    }
                };
                // With a fixed endpoint, rescale so the curve reaches
                // factor1 exactly at time1
                let mut fdif = factor1 - factor0;
                if let Some(t1) = time1 {
                    fdif /= 1.0 - (decay * (time0.days_after(t1) / DAYS_IN_YEAR)).exp();
                }
                Ok(TimeModel::Decay {
                    time0,
                    time1,
                    factor0,
                    factor1,
                    decay,
                    fdif,
                })
            }

            other => Err(Error::Definition(format!(
                "Invalid temporal model type {other}"
            ))),
        }
    }

    /// The scale factor at an instant
    pub fn factor_at(&self, t: Time) -> f64 {
        match self {
            TimeModel::Velocity { time0 } => t.days_after(*time0) / DAYS_IN_YEAR,

            TimeModel::Step {
                time0,
                factor0,
                factor1,
            } => {
                if t < *time0 {
                    *factor0
                } else {
                    *factor1
                }
            }

            TimeModel::Ramp {
                time0,
                time1,
                factor0,
                factor1,
                velocity,
            } => {
                if t <= *time0 {
                    *factor0
                } else if t >= *time1 {
                    *factor1
                } else {
                    factor0 + t.days_after(*time0) * velocity
                }
            }

            TimeModel::Decay {
                time0,
                time1,
                factor0,
                factor1,
                decay,
                fdif,
            } => {
                if t <= *time0 {
                    return *factor0;
                }
                if let Some(t1) = time1 {
                    if t >= *t1 {
                        return *factor1;
                    }
                }
                factor0 + fdif * (1.0 - (decay * (time0.days_after(t) / DAYS_IN_YEAR)).exp())
            }
        }
    }

    /// Whether the error factor is squared in addition to the load-time
    /// error-to-variance conversion. True only for the velocity shape.
    pub fn squares_variance_factor(&self) -> bool {
        matches!(self, TimeModel::Velocity { .. })
    }
}

fn both_factors(f0: Option<f64>, f1: Option<f64>, kind: &str) -> Result<(f64, f64), Error> {
    match (f0, f1) {
        (Some(f0), Some(f1)) => Ok((f0, f1)),
        _ => Err(Error::Definition(format!(
            "Initial or final scale factor missing for {kind} time model"
        ))),
    }
}

impl std::fmt::Display for TimeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeModel::Velocity { .. } => write!(f, "velocity model"),
            TimeModel::Step {
                time0,
                factor0,
                factor1,
            } => write!(f, "step from {factor0} to {factor1} at {time0}"),
            TimeModel::Ramp {
                time0,
                time1,
                factor0,
                factor1,
                ..
            } => write!(f, "ramp from {factor0} at {time0} to {factor1} at {time1}"),
            TimeModel::Decay {
                time0,
                time1,
                factor0,
                factor1,
                decay,
                ..
            } => {
                write!(
                    f,
                    "exponential decay (rate {decay}) from {factor0} at {time0} to {factor1}"
                )?;
                if let Some(t1) = time1 {
                    write!(f, " at {t1}")?;
                }
                Ok(())
            }
        }
    }
}

/// A time model bound to the valid date range of its component rows, with
/// the factor for the last `(date, baseDate)` pair memoised
#[derive(Clone, Debug)]
pub struct TimeFunction {
    model: TimeModel,
    min_date: Option<Time>,
    max_date: Option<Time>,
    time_complete: bool,
    // Memoised evaluation; value None means the latched out-of-range state
    memo: Option<(Time, Option<Time>)>,
    value: Option<(f64, f64)>,
}

impl TimeFunction {
    pub fn new(
        model: TimeModel,
        min_date: Option<Time>,
        max_date: Option<Time>,
        time_complete: bool,
    ) -> TimeFunction {
        TimeFunction {
            model,
            min_date,
            max_date,
            time_complete,
            memo: None,
            value: None,
        }
    }

    pub fn model(&self) -> &TimeModel {
        &self.model
    }

    /// The combined factor and error factor for a date pair:
    /// `f(date) - f(baseDate)` when a base date is present, `f(date)`
    /// otherwise. A sub-evaluation outside the valid range contributes zero
    /// for a time-complete function and fails the whole call otherwise;
    /// the failure is latched and re-raised while the inputs are unchanged.
    pub fn calc_factor(
        &mut self,
        date: Time,
        base_date: Option<Time>,
    ) -> Result<(f64, f64), Error> {
        if self.memo != Some((date, base_date)) {
            self.memo = Some((date, base_date));
            self.value = self.evaluate(date, base_date);
        }
        self.value
            .ok_or_else(|| Error::OutOfRange("Date outside valid range".to_string()))
    }

    fn evaluate(&self, date: Time, base_date: Option<Time>) -> Option<(f64, f64)> {
        let mut value = 0.0;
        for d in [base_date, Some(date)].into_iter().flatten() {
            let mut factor = 0.0;
            let outside = self.min_date.map_or(false, |m| d < m)
                || self.max_date.map_or(false, |m| d > m);
            if outside {
                if !self.time_complete {
                    return None;
                }
            } else {
                factor = self.model.factor_at(d);
                trace!("Time factor {factor} calculated at {d} for {}", self.model);
            }
            value = factor - value;
        }

        let mut error = value.abs();
        if self.model.squares_variance_factor() {
            error *= error;
        }
        Some((value, error))
    }
}

// ----- T E S T S ------------------------------------------------------------------
