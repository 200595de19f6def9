pub mod discovery;
pub mod logging;
pub mod plot;
pub mod qc;
pub mod tables;
