pub mod orchestrator;
pub mod processor;
pub mod router;
pub mod simulator;
pub mod strategy;
pub mod worker;
