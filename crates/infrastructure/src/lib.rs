pub mod database;
pub mod discovery;
pub mod id_generator;

pub use database::*;
pub use discovery::StaticWorkerDiscovery;
pub use id_generator::SequenceIdGenerator;
