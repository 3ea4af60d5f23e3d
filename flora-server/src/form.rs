//! Input constraints of the UI form. The core trusts whatever it is given, so
//! every request coming in over HTTP is checked here first.

use flora_core::{GenerationFields, MAX_SEED};
use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SliderLimits {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl SliderLimits {
    const fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    fn check(&self, field: &'static str, value: f64) -> Result<(), FieldError> {
        if !value.is_finite() {
            return Err(FieldError::NotFinite { field });
        }
        if value < self.min || value > self.max {
            return Err(FieldError::OutOfRange {
                field,
                min: self.min,
                max: self.max,
                value,
            });
        }
        Ok(())
    }

    /// Like [`SliderLimits::check`], and the value must also sit on a step.
    fn check_stepped(&self, field: &'static str, value: f64) -> Result<(), FieldError> {
        self.check(field, value)?;
        let offset = (value - self.min) / self.step;
        if (offset - offset.round()).abs() > 1e-9 {
            return Err(FieldError::OffStep {
                field,
                step: self.step,
                value,
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct FormLimits {
    pub guidance_scale: SliderLimits,
    pub steps: SliderLimits,
    pub width: SliderLimits,
    pub height: SliderLimits,
    pub seed: SliderLimits,
    pub adapter_scale: SliderLimits,
}

pub const LIMITS: FormLimits = FormLimits {
    guidance_scale: SliderLimits::new(1.0, 20.0, 0.5),
    steps: SliderLimits::new(1.0, 100.0, 1.0),
    width: SliderLimits::new(256.0, 1536.0, 64.0),
    height: SliderLimits::new(256.0, 1536.0, 64.0),
    seed: SliderLimits::new(0.0, MAX_SEED as f64, 1.0),
    adapter_scale: SliderLimits::new(0.0, 1.0, 0.01),
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{field} must be a multiple of {step}, got {value}")]
    OffStep {
        field: &'static str,
        step: f64,
        value: f64,
    },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
}

pub fn validate(fields: &GenerationFields) -> Result<(), FieldError> {
    // Range only: the example's 3.2 sits between slider steps.
    LIMITS
        .guidance_scale
        .check("guidance_scale", fields.guidance_scale)?;
    LIMITS.steps.check("steps", fields.steps as f64)?;
    // The autoencoder works on 16px patches; the UI only offers multiples of 64.
    LIMITS.width.check_stepped("width", fields.width as f64)?;
    LIMITS.height.check_stepped("height", fields.height as f64)?;
    LIMITS
        .adapter_scale
        .check_stepped("adapter_scale", fields.adapter_scale)?;
    Ok(())
}
