mod ewma;
mod rolling;

pub use ewma::EwmaLatency;
pub use rolling::RollingWindow;
