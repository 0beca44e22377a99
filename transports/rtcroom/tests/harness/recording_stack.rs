//! Stack factory that records what it builds
//!
//! Wraps the media-less stack and keeps each stack's event sender so tests
//! can inject ICE and track events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rtcroom::peer::fake::FakeStack;
use rtcroom::peer::{MediaStack, StackEvent, StackFactory, StackSpec};
use rtcroom::Result;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RecordingStackFactory {
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<StackEvent>>>,
    specs: Mutex<Vec<StackSpec>>,
}

impl RecordingStackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specs of every stack built so far, in build order
    pub fn specs(&self) -> Vec<StackSpec> {
        self.specs.lock().clone()
    }

    pub fn built(&self) -> usize {
        self.specs.lock().len()
    }

    /// Inject a stack event into the connection with `session_id`
    pub fn emit(&self, session_id: u64, event: StackEvent) -> bool {
        match self.senders.lock().get(&session_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl StackFactory for RecordingStackFactory {
    async fn build(
        &self,
        spec: &StackSpec,
        events: mpsc::UnboundedSender<StackEvent>,
    ) -> Result<Arc<dyn MediaStack>> {
        self.senders.lock().insert(spec.session_id, events.clone());
        self.specs.lock().push(spec.clone());
        Ok(Arc::new(FakeStack::new(spec, events)))
    }
}
