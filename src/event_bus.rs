// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Per-session publish/subscribe channel. Every engine completion and
// controller transition is announced here; nothing is returned to callers
// through direct return values once an operation has gone asynchronous.
//
// Several controllers may share one bus. Each notification carries the
// ControllerId of the session it belongs to, and subscriptions can be
// narrowed to a single controller.
//
// Bus subscriptions are for observers and may lose notifications when they
// fall behind. A controller reads its own notifications from an Inbox,
// which is fed by the same publisher and never drops anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::abstract_engine::{EngineHandle, HandleId, SelectionCriteria};
use crate::camera_error::CameraError;
use crate::image_buffer::EncodedImage;

const DEFAULT_CAPACITY: usize = 256;

/// Correlation token naming the controller a notification belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ControllerId(pub u64);

/// Outcome of a successful capture.
#[derive(Clone, Debug)]
pub struct PictureArtifact {
    pub width: u32,
    pub height: u32,
    /// Encoded bytes, if the transaction had an encoder stage.
    pub encoded: Option<EncodedImage>,
    /// Where the bytes were durably written, if the transaction had a
    /// persist stage.
    pub location: Option<Url>,
}

#[derive(Clone, Debug)]
pub enum CameraEvent {
    /// open() finished. `fault` is set if the camera could not be opened.
    EngineOpened { handle: HandleId, fault: Option<CameraError> },
    /// The controller is Ready on `handle`. Always follows the
    /// EngineOpened of the same handle.
    ControllerReady { handle: EngineHandle },
    /// Terminal notification of one capture.
    PictureTaken { handle: HandleId, result: Result<PictureArtifact, CameraError> },
    /// A smooth zoom ended, or an immediate zoom could not be applied.
    /// `level` is the level the camera actually reached.
    SmoothZoomCompleted { handle: HandleId, level: u32, fault: Option<CameraError> },
    NoSuchCamera { criteria: SelectionCriteria },
    FatalEngineFault { fault: CameraError },
    ControllerDestroyed,
}

#[derive(Clone, Debug)]
pub struct Notification {
    pub controller: ControllerId,
    pub event: CameraEvent,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notification>,
    next_controller_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A subscriber falling more than `capacity` notifications behind
    /// loses the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus{sender, next_controller_id: Arc::new(AtomicU64::new(1))}
    }

    /// Allocates a correlation token unique within this bus.
    pub fn register_controller(&self) -> ControllerId {
        ControllerId(self.next_controller_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn publisher(&self, controller: ControllerId) -> EventPublisher {
        EventPublisher{bus: self.clone(), controller, inbox: None}
    }

    /// A publisher for `controller` that also queues everything it
    /// publishes in the returned Inbox.
    pub fn publisher_with_inbox(&self, controller: ControllerId) -> (EventPublisher, Inbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (EventPublisher{bus: self.clone(), controller, inbox: Some(sender)},
         Inbox{receiver})
    }

    /// Publishing with nobody listening is not an error.
    pub fn publish(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            debug!("Notification dropped; no subscribers");
        }
    }

    /// Receives notifications for every controller on this bus.
    pub fn subscribe(&self) -> Subscription {
        Subscription{receiver: self.sender.subscribe(), filter: None}
    }

    /// Receives notifications for `controller` only.
    pub fn subscribe_to(&self, controller: ControllerId) -> Subscription {
        Subscription{receiver: self.sender.subscribe(), filter: Some(controller)}
    }
}

/// Publishes on behalf of one controller. Handed to the engine a controller
/// owns so that engine notifications carry the right correlation token.
#[derive(Clone)]
pub struct EventPublisher {
    bus: EventBus,
    controller: ControllerId,
    inbox: Option<mpsc::UnboundedSender<Notification>>,
}

impl EventPublisher {
    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn publish(&self, event: CameraEvent) {
        let notification = Notification{controller: self.controller, event};
        if let Some(inbox) = &self.inbox {
            if inbox.send(notification.clone()).is_err() {
                debug!("Inbox of {:?} is gone", self.controller);
            }
        }
        self.bus.publish(notification);
    }
}

/// Every notification published for one controller, in publish order.
pub struct Inbox {
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Inbox {
    /// Returns None once every publisher feeding this inbox is dropped.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<Notification>,
    filter: Option<ControllerId>,
}

impl Subscription {
    fn accepts(&self, notification: &Notification) -> bool {
        self.filter.map_or(true, |c| c == notification.controller)
    }

    /// Waits for the next matching notification. Returns None once every
    /// EventBus clone has been dropped.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(n) => {
                    if self.accepts(&n) {
                        return Some(n);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged; {} notifications lost", skipped);
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.try_recv() {
                Ok(n) => {
                    if self.accepts(&n) {
                        return Some(n);
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged; {} notifications lost", skipped);
                },
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Notification> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|n| (n, sub))
        }).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let controller = bus.register_controller();
        bus.publisher(controller).publish(CameraEvent::ControllerDestroyed);
    }

    #[tokio::test]
    async fn test_correlation_filter() {
        let bus = EventBus::new();
        let a = bus.register_controller();
        let b = bus.register_controller();
        assert_ne!(a, b);

        let mut only_b = bus.subscribe_to(b);
        let mut all = bus.subscribe();
        bus.publisher(a).publish(CameraEvent::ControllerDestroyed);
        bus.publisher(b).publish(CameraEvent::SmoothZoomCompleted{
            handle: HandleId(7), level: 3, fault: None});

        let n = only_b.recv().await.unwrap();
        assert_eq!(n.controller, b);
        assert!(matches!(n.event, CameraEvent::SmoothZoomCompleted{level: 3, ..}));
        assert!(only_b.try_recv().is_none());

        assert_eq!(all.recv().await.unwrap().controller, a);
        assert_eq!(all.recv().await.unwrap().controller, b);
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let controller = bus.register_controller();
        let stream = bus.subscribe().into_stream();
        bus.publisher(controller).publish(CameraEvent::ControllerDestroyed);
        drop(bus);
        let collected: Vec<Notification> = stream.collect().await;
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_can_be_polled_in_place() {
        let bus = EventBus::new();
        let controller = bus.register_controller();
        let mut stream = bus.subscribe_to(controller).into_stream();
        let publisher = bus.publisher(controller);
        let reader = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        publisher.publish(CameraEvent::ControllerDestroyed);
        let n = reader.await.unwrap().unwrap();
        assert!(matches!(n.event, CameraEvent::ControllerDestroyed));
    }

    #[tokio::test]
    async fn test_inbox_keeps_what_a_lagging_subscriber_loses() {
        let bus = EventBus::with_capacity(4);
        let a = bus.register_controller();
        let b = bus.register_controller();
        let (publisher, mut inbox) = bus.publisher_with_inbox(a);
        let mut observer = bus.subscribe_to(a);

        publisher.publish(CameraEvent::EngineOpened{handle: HandleId(1), fault: None});
        let other = bus.publisher(b);
        for _ in 0..20 {
            other.publish(CameraEvent::ControllerDestroyed);
        }
        // The observer fell behind and lost it.
        assert!(observer.try_recv().is_none());

        let n = inbox.try_recv().unwrap();
        assert_eq!(n.controller, a);
        assert!(matches!(n.event, CameraEvent::EngineOpened{handle: HandleId(1), ..}));
        assert!(inbox.try_recv().is_none());
    }
}
