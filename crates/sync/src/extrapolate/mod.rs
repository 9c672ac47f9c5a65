mod extrapolator;
mod interpolator;

pub use extrapolator::{
    Extrapolatable, Extrapolation, ExtrapolationFlags, ExtrapolationKind, Extrapolator,
};
pub use interpolator::{AccelDecel, EaseCurve, Interpolator};
