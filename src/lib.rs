pub mod configuration;
pub mod fork;
pub mod naming;
pub mod pipe;
pub mod port;
pub mod probe;
pub mod startup;
pub mod telemetry;
