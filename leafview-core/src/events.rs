use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::viewport::ViewMode;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ViewerEvent {
    ModeChanged { mode: ViewMode },
    PageChanged { index: usize },
    ZoomChanged { reduction: f32 },
    Resized { width: f32, height: f32 },
    FullscreenToggled { active: bool },
    RedrawNeeded,
}

pub type Subscriber = Box<dyn Fn(&ViewerEvent) + Send + Sync>;

/// Ordered notification log plus push subscribers.
pub struct EventBus {
    log: Arc<Mutex<Vec<ViewerEvent>>>,
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            subscribers: Vec::new(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.log)
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn emit(&self, event: ViewerEvent) {
        for subscriber in &self.subscribers {
            subscriber(&event);
        }
        self.log.lock().push(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
