mod cube;
mod fusion;
#[cfg(feature = "ndarray")]
mod ndarray;

pub use fusion::HasClient;
