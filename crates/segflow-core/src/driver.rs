use std::{
    collections::{BTreeMap, VecDeque},
    io,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    Action, ClientController, ClientState, ControllerError, ControllerEvent, Transition,
    diagnostics::DiagnosticsObserver,
};

/// Outbound half of the segment connection.
pub trait Transport {
    fn send_request(&mut self, bytes: u64) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// Fires controller events after a delay. Scheduled events are never
/// cancelled individually; the controller drops the ones that went stale.
pub trait Scheduler {
    fn schedule(&mut self, now_us: i64, after_us: i64, event: ControllerEvent);
    fn cancel_all(&mut self);
}

/// Requests waiting to be written by an I/O loop.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: VecDeque<u64>,
    closed: bool,
}

impl RequestQueue {
    pub fn pop(&mut self) -> Option<u64> {
        self.pending.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for RequestQueue {
    fn send_request(&mut self, bytes: u64) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "request queue closed"));
        }
        self.pending.push_back(bytes);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Deadline-ordered timers on the session clock. Events sharing a deadline
/// fire in scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(i64, u64), ControllerEvent>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn next_deadline(&self) -> Option<i64> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn pop_due(&mut self, now_us: i64) -> Option<(i64, ControllerEvent)> {
        let (&(deadline, seq), _) = self.entries.iter().next()?;
        if deadline > now_us {
            return None;
        }
        self.entries
            .remove(&(deadline, seq))
            .map(|event| (deadline, event))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Scheduler for TimerQueue {
    fn schedule(&mut self, now_us: i64, after_us: i64, event: ControllerEvent) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.insert((now_us.saturating_add(after_us.max(0)), seq), event);
    }

    fn cancel_all(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("transport failed: {0}")]
    Transport(#[from] io::Error),
}

/// Feeds transport and timer events into a controller and carries out the
/// actions each transition returns.
#[derive(Debug)]
pub struct SessionDriver<O, T, S> {
    controller: ClientController<O>,
    transport: T,
    scheduler: S,
}

impl<O, T, S> SessionDriver<O, T, S>
where
    O: DiagnosticsObserver,
    T: Transport,
    S: Scheduler,
{
    pub fn new(controller: ClientController<O>, transport: T, scheduler: S) -> Self {
        Self {
            controller,
            transport,
            scheduler,
        }
    }

    pub fn start(&mut self, now_us: i64) -> Result<(), DriverError> {
        let transition = self.controller.handle(ControllerEvent::Init, now_us)?;
        self.apply(transition, now_us)
    }

    pub fn on_bytes(&mut self, now_us: i64, bytes: u64) -> Result<(), DriverError> {
        match self.controller.on_bytes_received(now_us, bytes)? {
            Some(transition) => self.apply(transition, now_us),
            None => Ok(()),
        }
    }

    pub fn on_timer(&mut self, event: ControllerEvent, now_us: i64) -> Result<(), DriverError> {
        let transition = self.controller.handle(event, now_us)?;
        self.apply(transition, now_us)
    }

    pub fn is_finished(&self) -> bool {
        self.controller.state() == ClientState::Terminal
    }

    pub fn controller(&self) -> &ClientController<O> {
        &self.controller
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn into_controller(self) -> ClientController<O> {
        self.controller
    }

    fn apply(&mut self, transition: Transition, now_us: i64) -> Result<(), DriverError> {
        if transition.from != transition.to {
            debug!(
                from = ?transition.from,
                to = ?transition.to,
                at_us = now_us,
                "controller transition"
            );
        }
        for action in transition.actions {
            match action {
                Action::Request { bytes, .. } => self.transport.send_request(bytes)?,
                Action::Schedule { event, after_us } => {
                    self.scheduler.schedule(now_us, after_us, event)
                }
                Action::Close => {
                    self.scheduler.cancel_all();
                    self.transport.close()?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_then_schedule_order() {
        let mut timers = TimerQueue::default();
        timers.schedule(0, 500, ControllerEvent::PlaybackFinished);
        timers.schedule(100, 100, ControllerEvent::InterRequestDelayFinished);
        timers.schedule(0, 200, ControllerEvent::PlaybackFinished);

        assert_eq!(timers.next_deadline(), Some(200));
        assert_eq!(timers.pop_due(199), None);
        assert_eq!(
            timers.pop_due(200),
            Some((200, ControllerEvent::InterRequestDelayFinished))
        );
        assert_eq!(timers.pop_due(200), Some((200, ControllerEvent::PlaybackFinished)));
        assert_eq!(timers.len(), 1);

        timers.cancel_all();
        assert!(timers.is_empty());
    }

    #[test]
    fn closed_queue_rejects_requests() {
        let mut queue = RequestQueue::default();
        queue.send_request(10).unwrap();
        queue.close().unwrap();
        assert!(queue.is_closed());
        assert!(queue.send_request(20).is_err());
        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), None);
    }
}
