//! Peak shapes, background models and the joint region fitter.

pub mod background;
pub mod composite;
pub mod fitter;
pub mod gaussian;
pub mod peak;
pub mod result;
pub mod theuerkauf;

pub use background::{Background, BackgroundKind, BackgroundModel};
pub use fitter::Fitter;
pub use peak::{ParamMode, ParamPolicy, PeakKind, PeakShape, ShapeParam};
pub use result::{BackgroundSource, FitResult, PeakResult, PeakValues};
