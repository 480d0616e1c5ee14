//! Future tracking and callback delivery.
//!
//! Every asynchronous client call registers one [`TrackedEvent`] under a fresh [`FutureId`]. An
//! event becomes deliverable when the matching server completion arrives (`Ready`) or when a
//! local action cancels it (`Cancelled`). Cancellation wins: once cancelled, a late completion for
//! the same id is discarded, and a cancel overrides a `Ready` outcome that has not been delivered
//! yet.
//!
//! Delivery always removes the event from the table before invoking its callback, so a callback
//! can track, cancel or complete other events on the same manager.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use aero_wire_protocol::{
    AdapterInfo, DeviceLostReason, ErrorType, FutureId, MapAsyncStatus, ObjectHandle, ObjectType,
    PopErrorScopeStatus, QueueWorkDoneStatus, RequestAdapterStatus, RequestDeviceStatus,
};

/// When a completed future may invoke its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackMode {
    /// Only from [`crate::WireClient::wait_any`].
    WaitAnyOnly,
    /// From `wait_any` or [`crate::WireClient::process_events`].
    AllowProcessEvents,
    /// Additionally inline, right after the wire traffic or API call that completed it.
    AllowSpontaneous,
}

impl CallbackMode {
    fn allows_process_events(self) -> bool {
        !matches!(self, CallbackMode::WaitAnyOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The wire was disconnected.
    Dropped,
    /// A local action pre-empted the request.
    Aborted(String),
    /// The object owning the request was released.
    CallbackCancelled,
}

impl CancelReason {
    pub fn message(&self) -> String {
        match self {
            CancelReason::Dropped => "the wire client was disconnected".to_owned(),
            CancelReason::Aborted(message) => message.clone(),
            CancelReason::CallbackCancelled => {
                "the callback was cancelled because its owner was released".to_owned()
            }
        }
    }

    pub fn map_status(&self) -> MapAsyncStatus {
        match self {
            CancelReason::Dropped => MapAsyncStatus::InstanceDropped,
            CancelReason::Aborted(_) => MapAsyncStatus::Aborted,
            CancelReason::CallbackCancelled => MapAsyncStatus::CallbackCancelled,
        }
    }

    pub fn request_adapter_status(&self) -> RequestAdapterStatus {
        match self {
            CancelReason::Dropped => RequestAdapterStatus::InstanceDropped,
            CancelReason::Aborted(_) => RequestAdapterStatus::Error,
            CancelReason::CallbackCancelled => RequestAdapterStatus::CallbackCancelled,
        }
    }

    pub fn request_device_status(&self) -> RequestDeviceStatus {
        match self {
            CancelReason::Dropped => RequestDeviceStatus::InstanceDropped,
            CancelReason::Aborted(_) => RequestDeviceStatus::Error,
            CancelReason::CallbackCancelled => RequestDeviceStatus::CallbackCancelled,
        }
    }

    pub fn work_done_status(&self) -> QueueWorkDoneStatus {
        match self {
            CancelReason::Dropped => QueueWorkDoneStatus::InstanceDropped,
            CancelReason::Aborted(_) => QueueWorkDoneStatus::Error,
            CancelReason::CallbackCancelled => QueueWorkDoneStatus::CallbackCancelled,
        }
    }

    pub fn pop_error_scope_status(&self) -> PopErrorScopeStatus {
        match self {
            CancelReason::Dropped => PopErrorScopeStatus::InstanceDropped,
            CancelReason::Aborted(_) => PopErrorScopeStatus::Error,
            CancelReason::CallbackCancelled => PopErrorScopeStatus::CallbackCancelled,
        }
    }

    pub fn device_lost_reason(&self) -> DeviceLostReason {
        match self {
            CancelReason::Dropped => DeviceLostReason::InstanceDropped,
            CancelReason::Aborted(_) => DeviceLostReason::Unknown,
            CancelReason::CallbackCancelled => DeviceLostReason::CallbackCancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RequestAdapter,
    RequestDevice,
    MapAsync,
    WorkDone,
    PopErrorScope,
    DeviceLost,
}

/// Completion data carried from a server reply (or a local validation failure) to the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    RequestAdapter {
        status: RequestAdapterStatus,
        message: String,
        info: AdapterInfo,
        features: Vec<u32>,
    },
    RequestDevice {
        status: RequestDeviceStatus,
        message: String,
        features: Vec<u32>,
    },
    MapAsync {
        status: MapAsyncStatus,
        message: String,
    },
    WorkDone {
        status: QueueWorkDoneStatus,
        message: String,
    },
    PopErrorScope {
        status: PopErrorScopeStatus,
        error_type: ErrorType,
        message: String,
    },
    DeviceLost {
        reason: DeviceLostReason,
        message: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::RequestAdapter { .. } => EventKind::RequestAdapter,
            EventPayload::RequestDevice { .. } => EventKind::RequestDevice,
            EventPayload::MapAsync { .. } => EventKind::MapAsync,
            EventPayload::WorkDone { .. } => EventKind::WorkDone,
            EventPayload::PopErrorScope { .. } => EventKind::PopErrorScope,
            EventPayload::DeviceLost { .. } => EventKind::DeviceLost,
        }
    }
}

/// How an event ended: a payload, or the reason it was cancelled.
pub type Resolution = Result<EventPayload, CancelReason>;

/// Invoked once with the owning context, the future's id and its resolution.
pub type Deliver<C> = Box<dyn FnOnce(&mut C, FutureId, Resolution)>;

enum EventState {
    Pending,
    Ready(EventPayload),
    Cancelled(CancelReason),
}

struct TrackedEvent<C> {
    mode: CallbackMode,
    kind: EventKind,
    owner: Option<(ObjectType, ObjectHandle)>,
    state: EventState,
    deliver: Deliver<C>,
}

pub struct EventManager<C> {
    next_id: AtomicU64,
    events: BTreeMap<FutureId, TrackedEvent<C>>,
    /// Resolved events in the order they became deliverable.
    ready: VecDeque<FutureId>,
    dropped: bool,
}

impl<C> Default for EventManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventManager<C> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            events: BTreeMap::new(),
            ready: VecDeque::new(),
            dropped: false,
        }
    }

    /// Register a new future. After [`EventManager::drop_all`] the future starts out cancelled
    /// with [`CancelReason::Dropped`].
    pub fn track(
        &mut self,
        mode: CallbackMode,
        kind: EventKind,
        owner: Option<(ObjectType, ObjectHandle)>,
        deliver: Deliver<C>,
    ) -> FutureId {
        let id = FutureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = if self.dropped {
            self.ready.push_back(id);
            EventState::Cancelled(CancelReason::Dropped)
        } else {
            EventState::Pending
        };
        self.events.insert(
            id,
            TrackedEvent {
                mode,
                kind,
                owner,
                state,
                deliver,
            },
        );
        id
    }

    pub fn kind(&self, id: FutureId) -> Option<EventKind> {
        self.events.get(&id).map(|event| event.kind)
    }

    pub fn is_pending(&self, id: FutureId) -> bool {
        matches!(
            self.events.get(&id),
            Some(TrackedEvent {
                state: EventState::Pending,
                ..
            })
        )
    }

    pub fn is_resolved(&self, id: FutureId) -> bool {
        self.events
            .get(&id)
            .is_some_and(|event| !matches!(event.state, EventState::Pending))
    }

    pub fn is_tracked(&self, id: FutureId) -> bool {
        self.events.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Pending → Ready. Returns `false` (and drops `payload`) if the future is unknown, already
    /// resolved or cancelled.
    pub fn mark_ready(&mut self, id: FutureId, payload: EventPayload) -> bool {
        match self.events.get_mut(&id) {
            Some(event) if matches!(event.state, EventState::Pending) => {
                event.state = EventState::Ready(payload);
                self.ready.push_back(id);
                true
            }
            _ => false,
        }
    }

    /// Pending or Ready → Cancelled. Idempotent: an already cancelled future keeps its first
    /// reason.
    pub fn cancel(&mut self, id: FutureId, reason: CancelReason) -> bool {
        let Some(event) = self.events.get_mut(&id) else {
            return false;
        };
        match event.state {
            EventState::Cancelled(_) => false,
            EventState::Pending => {
                event.state = EventState::Cancelled(reason);
                self.ready.push_back(id);
                true
            }
            EventState::Ready(_) => {
                event.state = EventState::Cancelled(reason);
                true
            }
        }
    }

    /// Cancel every unresolved or undelivered event owned by `owner`.
    pub fn cancel_owned_by(&mut self, owner: (ObjectType, ObjectHandle), reason: CancelReason) {
        let owned: Vec<FutureId> = self
            .events
            .iter()
            .filter(|(_, event)| event.owner == Some(owner))
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            self.cancel(id, reason.clone());
        }
    }

    /// Cancel everything with [`CancelReason::Dropped`] and make every future tracked from now on
    /// start out dropped.
    pub fn drop_all(&mut self) {
        self.dropped = true;
        let ids: Vec<FutureId> = self.events.keys().copied().collect();
        for id in ids {
            self.cancel(id, CancelReason::Dropped);
        }
    }

    /// Remove a resolved event for delivery.
    pub fn take(&mut self, id: FutureId) -> Option<(Deliver<C>, Resolution)> {
        if !self.is_resolved(id) {
            return None;
        }
        let event = self.events.remove(&id)?;
        self.ready.retain(|queued| *queued != id);
        let resolution = match event.state {
            EventState::Ready(payload) => Ok(payload),
            EventState::Cancelled(reason) => Err(reason),
            EventState::Pending => return None,
        };
        Some((event.deliver, resolution))
    }

    /// Resolved events deliverable from `process_events`, in ready order.
    pub fn process_events_batch(&self) -> Vec<FutureId> {
        self.ready_matching(|mode| mode.allows_process_events())
    }

    /// Next resolved event that may be delivered inline.
    pub fn next_spontaneous(&self) -> Option<FutureId> {
        self.ready.iter().copied().find(|id| {
            self.events
                .get(id)
                .is_some_and(|event| event.mode == CallbackMode::AllowSpontaneous)
        })
    }

    /// Every resolved event, in ready order, regardless of mode.
    pub fn all_resolved(&self) -> Vec<FutureId> {
        self.ready_matching(|_| true)
    }

    fn ready_matching(&self, allowed: impl Fn(CallbackMode) -> bool) -> Vec<FutureId> {
        self.ready
            .iter()
            .copied()
            .filter(|id| self.events.get(id).is_some_and(|event| allowed(event.mode)))
            .collect()
    }
}
