pub mod quantile;
pub mod significance;
pub mod streaming;
