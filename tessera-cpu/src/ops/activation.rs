//! Scalar activation functions used by the FFN layer.

use tessera::params::ActivationType;
use tessera::{OpError, Result};

/// GELU activation (approximate): 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))
#[must_use]
pub fn gelu_approx(x: f32) -> f32 {
    let coeff = 0.797_884_6; // sqrt(2/π)
    let inner = coeff * x.mul_add(0.044_715 * x * x, x);
    0.5 * x * (1.0 + inner.tanh())
}

/// GELU activation (exact): 0.5 * x * (1 + erf(x / sqrt(2)))
#[must_use]
pub fn gelu_erf(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, max abs error 1.5e-7.
fn erf(x: f32) -> f32 {
    const P: f32 = 0.327_591_1;
    const A: [f32; 5] = [
        0.254_829_6,
        -0.284_496_74,
        1.421_413_7,
        -1.453_152_1,
        1.061_405_4,
    ];
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / P.mul_add(x, 1.0);
    let poly = A.iter().rev().fold(0.0f32, |acc, &a| acc.mul_add(t, a)) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[must_use]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SiLU / swish: x * sigmoid(x)
#[must_use]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

fn identity(x: f32) -> f32 {
    x
}

/// Scalar function applied by `kind`. Gated variants return the function
/// applied to the gate branch.
///
/// # Errors
/// `Unimplemented` for `InvalidType`.
pub fn activation_fn(kind: ActivationType) -> Result<fn(f32) -> f32> {
    let f: fn(f32) -> f32 = match kind {
        ActivationType::Gelu | ActivationType::GeGLU => gelu_approx,
        ActivationType::GeluNoneApproximate | ActivationType::GeGluNoneApproximate => gelu_erf,
        ActivationType::Relu | ActivationType::ReGLU => relu,
        ActivationType::Silu | ActivationType::SiGLU => silu,
        ActivationType::Identity => identity,
        ActivationType::InvalidType => {
            return Err(OpError::unimplemented("activation: invalid activation type"))
        }
    };
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gelu_variants_agree_closely() {
        for x in [-3.0f32, -1.0, -0.1, 0.0, 0.5, 2.0] {
            assert!((gelu_approx(x) - gelu_erf(x)).abs() < 1e-3, "x = {x}");
        }
        assert!((gelu_erf(1.0) - 0.841_344_7).abs() < 1e-5);
    }

    #[test]
    fn test_erf_is_odd() {
        assert!((erf(0.7) + erf(-0.7)).abs() < 1e-7);
        assert!((erf(3.0) - 0.999_977_9).abs() < 1e-6);
    }

    #[test]
    fn test_simple_activations() {
        assert!((relu(-2.0)).abs() < f32::EPSILON);
        assert!((sigmoid(0.0) - 0.5).abs() < f32::EPSILON);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-6);
    }

    #[test]
    fn test_activation_fn_dispatch() {
        let f = activation_fn(ActivationType::SiGLU).unwrap();
        assert!((f(1.0) - silu(1.0)).abs() < f32::EPSILON);
        let f = activation_fn(ActivationType::Identity).unwrap();
        assert!((f(-4.0) + 4.0).abs() < f32::EPSILON);
        assert!(activation_fn(ActivationType::InvalidType).is_err());
    }
}
