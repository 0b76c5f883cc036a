//! Survey analysis: validation, cleaning, aggregation, trend and anomaly detection, and the
//! job machinery that runs them per (company, survey, window).

pub mod aggregate;
pub mod anomaly;
pub mod cleaner;
pub mod jobs;
pub mod pipeline;
pub mod results;
pub mod stats;
pub mod trend;
pub mod validator;
