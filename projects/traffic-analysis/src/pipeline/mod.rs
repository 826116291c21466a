// Camera snapshot processing pipeline

pub mod annotate;
pub mod classes;
pub mod detection;
pub mod download;
pub mod fetch;
pub mod ingress;
pub mod orchestrator;
pub mod queue;
pub mod remote;
#[cfg(feature = "rtdetr")]
pub mod rtdetr;
pub mod scheduler;
pub mod storage;
#[cfg(test)]
pub mod testing;
pub mod types;
pub mod upload;
pub mod workers;
