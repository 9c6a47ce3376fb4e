//! Lap notification consumers
//!
//! Consumers are notified in registration order and each notification is
//! awaited before the next one, so one tick flows through the whole chain
//! before the producing lap is considered complete.

use std::sync::Arc;

use async_trait::async_trait;
use castle_types::{ControlContext, EngineContext};
use parking_lot::RwLock;

/// Receives engine contexts at lap boundaries
#[async_trait]
pub trait ContextConsumer: Send + Sync {
    /// Called before the producing engine runs its parts
    async fn on_lap_start(&self, _source: &str, _lap: u64) {}

    /// Called with the context produced by a lap
    async fn on_context(&self, source: &str, context: Arc<EngineContext>);
}

/// Receives control contexts produced by control engines
#[async_trait]
pub trait ControlConsumer: Send + Sync {
    async fn on_control(&self, source: &str, control: Arc<ControlContext>);
}

/// Ordered list of consumers
pub struct Consumers<T: ?Sized> {
    list: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Consumers<T> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Consumers<T> {
    pub fn subscribe(&self, consumer: Arc<T>) {
        self.list.write().push(consumer);
    }

    /// Current consumers in registration order
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.list.read().clone()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }
}

impl Consumers<dyn ContextConsumer> {
    pub async fn notify_lap_start(&self, source: &str, lap: u64) {
        for consumer in self.snapshot() {
            consumer.on_lap_start(source, lap).await;
        }
    }

    pub async fn notify_context(&self, source: &str, context: Arc<EngineContext>) {
        for consumer in self.snapshot() {
            consumer.on_context(source, Arc::clone(&context)).await;
        }
    }
}

impl Consumers<dyn ControlConsumer> {
    pub async fn notify_control(&self, source: &str, control: Arc<ControlContext>) {
        for consumer in self.snapshot() {
            consumer.on_control(source, Arc::clone(&control)).await;
        }
    }
}
