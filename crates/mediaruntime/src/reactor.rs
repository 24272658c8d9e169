//! Single-threaded reactor for the data loop.
//!
//! Sources are events (a counter that stays ready until dispatched), idle
//! sources (ready on every wait while enabled) and timers. All of them are
//! registered through a [`LoopRef`], which is cheap to clone and lives on
//! the data thread only. Other threads reach the loop through a
//! [`LoopHandle`]; whatever they send is turned into readiness on the data
//! thread and never touches graph state directly.
//!
//! [`Reactor::wait`] is the only place the data thread suspends.

use crate::access::PermissionReply;
use crate::monitor::DeviceEvent;
use mediacore::{IdAllocator, MediaError, NodeId, SourceId};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    #[error("Unknown source: {0}")]
    UnknownSource(SourceId),

    #[error("Source {0} is not a {1}")]
    WrongKind(SourceId, &'static str),

    #[error("Data loop is gone")]
    Closed,
}

impl From<ReactorError> for MediaError {
    fn from(e: ReactorError) -> Self {
        MediaError::Reactor(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Event,
    Idle,
    Timer,
}

/// Messages other threads can post to the data loop
#[derive(Debug)]
pub enum LoopMessage {
    /// Make an event source ready, like writing to an eventfd
    Signal(SourceId),
    Permission(PermissionReply),
    Device { device: u32, event: DeviceEvent },
    Quit,
}

/// One entry of the readiness list returned by [`Reactor::wait`]
#[derive(Debug)]
pub enum Ready {
    Source {
        id: SourceId,
        owner: Option<NodeId>,
        kind: SourceKind,
        /// Event count or timer expirations since the last dispatch
        count: u64,
    },
    Message(LoopMessage),
}

#[derive(Debug)]
struct TimerState {
    deadline: Option<Instant>,
    interval: Option<Duration>,
}

#[derive(Debug)]
struct SourceEntry {
    owner: Option<NodeId>,
    kind: SourceKind,
    pending: u64,
    enabled: bool,
    timer: TimerState,
}

#[derive(Debug, Default)]
struct ReactorState {
    ids: IdAllocator,
    sources: HashMap<SourceId, SourceEntry>,
    timers: BTreeSet<(Instant, SourceId)>,
    signalled: VecDeque<SourceId>,
}

impl ReactorState {
    fn add(&mut self, owner: Option<NodeId>, kind: SourceKind, enabled: bool) -> SourceId {
        let id: SourceId = self.ids.next();
        self.sources.insert(
            id,
            SourceEntry {
                owner,
                kind,
                pending: 0,
                enabled,
                timer: TimerState {
                    deadline: None,
                    interval: None,
                },
            },
        );
        tracing::trace!(%id, ?kind, ?owner, "source added");
        id
    }

    fn entry(&mut self, id: SourceId, kind: SourceKind) -> Result<&mut SourceEntry, ReactorError> {
        let entry = self
            .sources
            .get_mut(&id)
            .ok_or(ReactorError::UnknownSource(id))?;
        if entry.kind != kind {
            let name = match kind {
                SourceKind::Event => "event",
                SourceKind::Idle => "idle source",
                SourceKind::Timer => "timer",
            };
            return Err(ReactorError::WrongKind(id, name));
        }
        Ok(entry)
    }

    fn signal(&mut self, id: SourceId) -> Result<(), ReactorError> {
        let entry = self.entry(id, SourceKind::Event)?;
        entry.pending += 1;
        if entry.pending == 1 {
            self.signalled.push_back(id);
        }
        Ok(())
    }

    fn disarm(&mut self, id: SourceId) {
        if let Some(entry) = self.sources.get_mut(&id) {
            if let Some(deadline) = entry.timer.deadline.take() {
                self.timers.remove(&(deadline, id));
            }
            entry.timer.interval = None;
        }
    }

    fn remove(&mut self, id: SourceId) -> Result<(), ReactorError> {
        self.disarm(id);
        self.sources
            .remove(&id)
            .ok_or(ReactorError::UnknownSource(id))?;
        self.signalled.retain(|s| *s != id);
        tracing::trace!(%id, "source removed");
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().next().map(|(at, _)| *at)
    }

    fn collect(&mut self, now: Instant, out: &mut Vec<Ready>) {
        // timers
        while let Some(&(deadline, id)) = self.timers.iter().next() {
            if deadline > now {
                break;
            }
            self.timers.remove(&(deadline, id));
            let Some(entry) = self.sources.get_mut(&id) else {
                continue;
            };
            let mut expirations: u64 = 1;
            match entry.timer.interval {
                Some(interval) if !interval.is_zero() => {
                    let late = now.saturating_duration_since(deadline);
                    let missed = u64::try_from(late.as_nanos() / interval.as_nanos()).unwrap_or(u64::MAX);
                    expirations = expirations.saturating_add(missed);
                    let next = rearm_deadline(deadline, interval, missed, now);
                    entry.timer.deadline = Some(next);
                    self.timers.insert((next, id));
                }
                _ => entry.timer.deadline = None,
            }
            out.push(Ready::Source {
                id,
                owner: entry.owner,
                kind: SourceKind::Timer,
                count: expirations,
            });
        }

        // events
        while let Some(id) = self.signalled.pop_front() {
            if let Some(entry) = self.sources.get_mut(&id) {
                let count = std::mem::take(&mut entry.pending);
                if count > 0 {
                    out.push(Ready::Source {
                        id,
                        owner: entry.owner,
                        kind: SourceKind::Event,
                        count,
                    });
                }
            }
        }

        // idle
        let mut idle: Vec<_> = self
            .sources
            .iter()
            .filter(|(_, e)| e.kind == SourceKind::Idle && e.enabled)
            .map(|(id, e)| (*id, e.owner))
            .collect();
        idle.sort_by_key(|(id, _)| *id);
        out.extend(idle.into_iter().map(|(id, owner)| Ready::Source {
            id,
            owner,
            kind: SourceKind::Idle,
            count: 1,
        }));
    }
}

/// Data-thread access to the reactor's source table.
#[derive(Debug, Clone)]
pub struct LoopRef(Rc<RefCell<ReactorState>>);

impl LoopRef {
    pub fn add_event(&self, owner: Option<NodeId>) -> SourceId {
        self.0.borrow_mut().add(owner, SourceKind::Event, true)
    }

    /// Increment the event counter; the source stays ready until dispatched.
    pub fn signal(&self, id: SourceId) -> Result<(), ReactorError> {
        self.0.borrow_mut().signal(id)
    }

    pub fn add_idle(&self, owner: Option<NodeId>, enabled: bool) -> SourceId {
        self.0.borrow_mut().add(owner, SourceKind::Idle, enabled)
    }

    pub fn enable_idle(&self, id: SourceId, enabled: bool) -> Result<(), ReactorError> {
        let mut state = self.0.borrow_mut();
        state.entry(id, SourceKind::Idle)?.enabled = enabled;
        Ok(())
    }

    /// New timer, initially disarmed
    pub fn add_timer(&self, owner: Option<NodeId>) -> SourceId {
        self.0.borrow_mut().add(owner, SourceKind::Timer, true)
    }

    /// Arm a timer to fire after `value`, then every `interval` if given.
    /// `None` disarms it.
    pub fn update_timer(
        &self,
        id: SourceId,
        value: Option<Duration>,
        interval: Option<Duration>,
    ) -> Result<(), ReactorError> {
        let mut state = self.0.borrow_mut();
        state.entry(id, SourceKind::Timer)?;
        state.disarm(id);
        if let Some(value) = value {
            let deadline = Instant::now() + value;
            if let Some(entry) = state.sources.get_mut(&id) {
                entry.timer.deadline = Some(deadline);
                entry.timer.interval = interval;
            }
            state.timers.insert((deadline, id));
        }
        Ok(())
    }

    pub fn is_armed(&self, id: SourceId) -> bool {
        self.0
            .borrow()
            .sources
            .get(&id)
            .map(|e| e.timer.deadline.is_some())
            .unwrap_or(false)
    }

    pub fn remove_source(&self, id: SourceId) -> Result<(), ReactorError> {
        self.0.borrow_mut().remove(id)
    }

    /// Remove every source registered on behalf of `owner`, disarming its
    /// timers. Returns how many were removed.
    pub fn remove_owned(&self, owner: NodeId) -> usize {
        let mut state = self.0.borrow_mut();
        let owned: Vec<SourceId> = state
            .sources
            .iter()
            .filter(|(_, e)| e.owner == Some(owner))
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            let _ = state.remove(*id);
        }
        owned.len()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.0.borrow().sources.contains_key(&id)
    }

    pub fn n_sources(&self) -> usize {
        self.0.borrow().sources.len()
    }

    /// Number of sources owned by `owner`
    pub fn n_owned(&self, owner: NodeId) -> usize {
        self.0
            .borrow()
            .sources
            .values()
            .filter(|e| e.owner == Some(owner))
            .count()
    }
}

/// Thread-safe handle used to wake the data loop from elsewhere
#[derive(Debug, Clone)]
pub struct LoopHandle {
    sender: mpsc::UnboundedSender<LoopMessage>,
}

impl LoopHandle {
    pub fn send(&self, message: LoopMessage) -> Result<(), ReactorError> {
        self.sender.send(message).map_err(|_| ReactorError::Closed)
    }

    pub fn signal(&self, id: SourceId) -> Result<(), ReactorError> {
        self.send(LoopMessage::Signal(id))
    }

    pub fn quit(&self) -> Result<(), ReactorError> {
        self.send(LoopMessage::Quit)
    }
}

pub struct Reactor {
    state: LoopRef,
    sender: mpsc::UnboundedSender<LoopMessage>,
    receiver: mpsc::UnboundedReceiver<LoopMessage>,
}

impl Reactor {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: LoopRef(Rc::new(RefCell::new(ReactorState::default()))),
            sender,
            receiver,
        }
    }

    pub fn loop_ref(&self) -> LoopRef {
        self.state.clone()
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            sender: self.sender.clone(),
        }
    }

    /// Everything that is ready right now, without blocking.
    pub fn poll(&mut self) -> Vec<Ready> {
        let mut out = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            self.accept(message, &mut out);
        }
        self.state.0.borrow_mut().collect(Instant::now(), &mut out);
        out
    }

    /// Block until at least one source is ready or a message arrives.
    pub async fn wait(&mut self) -> Vec<Ready> {
        loop {
            let ready = self.poll();
            if !ready.is_empty() {
                return ready;
            }

            let deadline = self.state.0.borrow().next_deadline();
            let message = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.receiver.recv()).await {
                    Ok(message) => message,
                    Err(_) => continue,
                },
                None => self.receiver.recv().await,
            };

            match message {
                Some(message) => {
                    let mut out = Vec::new();
                    self.accept(message, &mut out);
                    if !out.is_empty() {
                        return out;
                    }
                }
                // we hold a sender ourselves, so this only happens on teardown
                None => return Vec::new(),
            }
        }
    }

    fn accept(&mut self, message: LoopMessage, out: &mut Vec<Ready>) {
        match message {
            LoopMessage::Signal(id) => {
                if let Err(e) = self.state.signal(id) {
                    tracing::debug!(%id, "dropping wakeup: {}", e);
                }
            }
            other => out.push(Ready::Message(other)),
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// First multiple of `interval` after `deadline` that lies past `now`.
fn rearm_deadline(deadline: Instant, interval: Duration, missed: u64, now: Instant) -> Instant {
    u32::try_from(missed.saturating_add(1))
        .ok()
        .and_then(|steps| interval.checked_mul(steps))
        .and_then(|offset| deadline.checked_add(offset))
        .filter(|next| *next > now)
        .unwrap_or(now + interval)
}
