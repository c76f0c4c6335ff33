pub mod checkout;
pub mod engine;
pub mod evaluation;
pub mod extractor;
pub mod orchestrator;
pub mod poller;
pub mod recorder;
