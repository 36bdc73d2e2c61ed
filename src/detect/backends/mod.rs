pub mod color;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use color::ColorBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
