//! Scattering-curve data model: typed point store, flag columns with
//! interval algebra, rescaling transform, and fitted-state binding.

pub mod curve;
pub mod flags;

pub use curve::{
    AddDataOptions, Average, DataRow, DataSelect, MeanPoint, MeanSelect, SaxsProfile,
    SelectedPoint, subsample_indices,
};
pub use flags::{FlagKind, FlagValue, Interval};
