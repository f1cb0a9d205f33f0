//! Delivery sink contract.

use argus_core::Detection;

use crate::error::DetectError;

/// External delivery mechanism for finished detections.
///
/// `start` and `end` bracket one run, so implementations can open and flush
/// their destination exactly once per run.
pub trait DetectionSink {
    fn start(&mut self) -> Result<(), DetectError> {
        Ok(())
    }

    fn accept(&mut self, detection: Detection) -> Result<(), DetectError>;

    fn end(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}

/// Collects detections in memory. Used by tests and as a null destination.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub detections: Vec<Detection>,
    pub started: u64,
    pub ended: u64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectionSink for MemorySink {
    fn start(&mut self) -> Result<(), DetectError> {
        self.started += 1;
        Ok(())
    }

    fn accept(&mut self, detection: Detection) -> Result<(), DetectError> {
        self.detections.push(detection);
        Ok(())
    }

    fn end(&mut self) -> Result<(), DetectError> {
        self.ended += 1;
        Ok(())
    }
}
