pub mod convolution;

pub use convolution::{ConvolutionEngine, ConvolutionError, convolve_flux, discretize_profile};
