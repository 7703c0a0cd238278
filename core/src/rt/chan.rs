//! Channels, select, and the global scheduler lock.
//!
//! One mutex guards every channel plus the live/blocked task counters, so
//! readiness checks and the deadlock test are atomic with respect to each
//! other. A task that must wait parks on the shared condvar. Deadlock is
//! declared only when every live task has parked since the last
//! state-changing notification: a notification moves everyone parked so
//! far into a waking bucket that does not count, because those tasks have
//! a wakeup in flight and will rescan before parking again.
//!
//! Unbuffered channels rendezvous through an offer queue: the sender posts
//! its value, parks, and completes only once a receiver has taken the
//! offer. Buffered channels are plain FIFO rings bounded by capacity.

use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;

use crate::util::fast_map::{FastHashMap, FastHashSet};
use crate::val::{ChanId, Value};

use super::{FaultKind, ProcessFault};

struct Offer {
    id: u64,
    value: Value,
}

struct ChanState {
    cap: usize,
    buf: VecDeque<Value>,
    closed: bool,
    zero: Value,
    /// Parked rendezvous senders, in arrival order.
    offers: VecDeque<Offer>,
    /// Offer ids a receiver has consumed; the sender clears its own entry.
    taken: FastHashSet<u64>,
    /// Tasks currently parked waiting to receive on this channel. Used to
    /// judge send-readiness of unbuffered channels inside select.
    recv_waiters: usize,
}

pub(crate) struct SchedInner {
    chans: FastHashMap<u64, ChanState>,
    next_chan: u64,
    next_offer: u64,
    pub(crate) live: usize,
    /// Wakeup generation, bumped by every state-changing notification.
    epoch: u64,
    /// Tasks parked since the last state-changing notification.
    blocked: usize,
    /// Tasks still parked from an earlier generation. They have a wakeup
    /// in flight and never count toward deadlock.
    waking: usize,
    pub(crate) fault: Option<ProcessFault>,
}

pub(crate) struct Sched {
    inner: Mutex<SchedInner>,
    cv: Condvar,
}

/// A select arm after operand evaluation. `chan` is `None` for a nil
/// channel, which is never ready.
pub enum RtCase {
    Send { chan: Option<ChanId>, value: Value },
    Recv { chan: Option<ChanId> },
}

/// Result of a select: the chosen arm (or `cases.len()` for the default of
/// a non-blocking select) and, for receive arms, the value and ok flag.
pub struct SelectOutcome {
    pub index: usize,
    pub recv: Option<(Value, bool)>,
}

/// Inner error is a recoverable runtime panic message; outer error is a
/// process fault.
type ChanResult<T> = Result<std::result::Result<T, String>>;

impl Sched {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SchedInner {
                chans: FastHashMap::default(),
                next_chan: 1,
                next_offer: 1,
                live: 1,
                epoch: 0,
                blocked: 0,
                waking: 0,
                fault: None,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedInner> {
        self.inner.lock()
    }

    pub(crate) fn notify_all(&self) {
        self.cv.notify_all();
    }

    pub(crate) fn record_fault(&self, kind: FaultKind, report: String) {
        let mut g = self.inner.lock();
        if g.fault.is_none() {
            g.fault = Some(ProcessFault { kind, report });
        }
        self.cv.notify_all();
    }

    fn fault_err(f: &ProcessFault) -> anyhow::Error {
        anyhow::Error::new(f.clone())
    }

    fn check_fault(g: &SchedInner) -> Result<()> {
        match &g.fault {
            Some(f) => Err(Self::fault_err(f)),
            None => Ok(()),
        }
    }

    /// Notify after a channel state change. Everyone parked so far gets a
    /// chance to rescan before the deadlock test can fire again.
    fn wake(&self, g: &mut SchedInner) {
        g.epoch += 1;
        g.waking += g.blocked;
        g.blocked = 0;
        self.cv.notify_all();
    }

    /// Park the calling task until something changes. Fails with a process
    /// fault if every live task is now parked with no wakeup in flight.
    fn park(&self, g: &mut MutexGuard<'_, SchedInner>) -> Result<()> {
        Self::check_fault(g)?;
        let slept_at = g.epoch;
        g.blocked += 1;
        if g.blocked == g.live {
            g.blocked -= 1;
            let fault = ProcessFault {
                kind: FaultKind::Deadlock,
                report: "fatal error: all tasks are asleep - deadlock!".to_string(),
            };
            g.fault = Some(fault.clone());
            self.cv.notify_all();
            return Err(Self::fault_err(&fault));
        }
        self.cv.wait(g);
        if g.epoch == slept_at {
            g.blocked -= 1;
        } else {
            g.waking -= 1;
        }
        Self::check_fault(g)
    }

    /// A send or receive on a nil channel blocks forever; only a process
    /// fault (usually the deadlock detector) releases it.
    pub(crate) fn block_forever(&self) -> anyhow::Error {
        let mut g = self.inner.lock();
        loop {
            if let Err(e) = self.park(&mut g) {
                return e;
            }
        }
    }

    pub(crate) fn make_chan(&self, cap: usize, zero: Value) -> ChanId {
        let mut g = self.inner.lock();
        let id = g.next_chan;
        g.next_chan += 1;
        g.chans.insert(
            id,
            ChanState {
                cap,
                buf: VecDeque::new(),
                closed: false,
                zero,
                offers: VecDeque::new(),
                taken: FastHashSet::default(),
                recv_waiters: 0,
            },
        );
        ChanId(id)
    }

    fn chan<'g>(g: &'g mut SchedInner, id: ChanId) -> Result<&'g mut ChanState> {
        g.chans
            .get_mut(&id.0)
            .ok_or_else(|| anyhow!("unknown channel handle {}", id.0))
    }

    pub(crate) fn send(&self, id: ChanId, value: Value) -> ChanResult<()> {
        let mut g = self.inner.lock();
        loop {
            Self::check_fault(&g)?;
            let ch = Self::chan(&mut g, id)?;
            if ch.closed {
                return Ok(Err("send on closed channel".to_string()));
            }
            if ch.cap > 0 {
                if ch.buf.len() < ch.cap {
                    ch.buf.push_back(value);
                    self.wake(&mut g);
                    return Ok(Ok(()));
                }
                self.park(&mut g)?;
                continue;
            }
            // Rendezvous: post the offer, then wait for a receiver.
            let offer_id = g.next_offer;
            g.next_offer += 1;
            let ch = Self::chan(&mut g, id)?;
            ch.offers.push_back(Offer { id: offer_id, value });
            self.wake(&mut g);
            loop {
                let ch = Self::chan(&mut g, id)?;
                if ch.taken.remove(&offer_id) {
                    return Ok(Ok(()));
                }
                if ch.closed {
                    ch.offers.retain(|o| o.id != offer_id);
                    return Ok(Err("send on closed channel".to_string()));
                }
                self.park(&mut g)?;
            }
        }
    }

    pub(crate) fn recv(&self, id: ChanId) -> ChanResult<(Value, bool)> {
        let mut g = self.inner.lock();
        let mut advertised = false;
        loop {
            Self::check_fault(&g)?;
            let ch = Self::chan(&mut g, id)?;
            if let Some(v) = ch.buf.pop_front() {
                self.wake(&mut g);
                return Ok(Ok((v, true)));
            }
            if let Some(offer) = ch.offers.pop_front() {
                ch.taken.insert(offer.id);
                self.wake(&mut g);
                return Ok(Ok((offer.value, true)));
            }
            if ch.closed {
                return Ok(Ok((ch.zero.clone(), false)));
            }
            ch.recv_waiters += 1;
            // A waiting receiver makes unbuffered send arms ready; anyone
            // already parked on such an arm must rescan. The lock is held
            // between park cycles, so later iterations change nothing
            // observable and park silently.
            if !advertised {
                advertised = true;
                self.wake(&mut g);
            }
            let parked = self.park(&mut g);
            if let Ok(ch) = Self::chan(&mut g, id) {
                ch.recv_waiters -= 1;
            }
            parked?;
        }
    }

    pub(crate) fn close(&self, id: ChanId) -> ChanResult<()> {
        let mut g = self.inner.lock();
        Self::check_fault(&g)?;
        let ch = Self::chan(&mut g, id)?;
        if ch.closed {
            return Ok(Err("close of closed channel".to_string()));
        }
        ch.closed = true;
        self.wake(&mut g);
        Ok(Ok(()))
    }

    pub(crate) fn chan_len(&self, id: ChanId) -> Result<usize> {
        let mut g = self.inner.lock();
        Ok(Self::chan(&mut g, id)?.buf.len())
    }

    pub(crate) fn chan_cap(&self, id: ChanId) -> Result<usize> {
        let mut g = self.inner.lock();
        Ok(Self::chan(&mut g, id)?.cap)
    }

    fn case_ready(g: &mut SchedInner, case: &RtCase) -> Result<bool> {
        Ok(match case {
            RtCase::Send { chan: None, .. } | RtCase::Recv { chan: None } => false,
            RtCase::Send { chan: Some(id), .. } => {
                let ch = Self::chan(g, *id)?;
                ch.closed
                    || (ch.cap > 0 && ch.buf.len() < ch.cap)
                    || (ch.cap == 0 && ch.recv_waiters > 0)
            }
            RtCase::Recv { chan: Some(id) } => {
                let ch = Self::chan(g, *id)?;
                ch.closed || !ch.buf.is_empty() || !ch.offers.is_empty()
            }
        })
    }

    /// Uniform choice among ready arms. The non-blocking form reports
    /// `cases.len()` when nothing is ready; the blocking form parks and
    /// rescans until an arm fires.
    pub(crate) fn select(
        &self,
        cases: Vec<RtCase>,
        blocking: bool,
    ) -> ChanResult<SelectOutcome> {
        let mut g = self.inner.lock();
        let mut advertised = false;
        loop {
            Self::check_fault(&g)?;
            let mut ready = Vec::new();
            for (i, case) in cases.iter().enumerate() {
                if Self::case_ready(&mut g, case)? {
                    ready.push(i);
                }
            }
            if !ready.is_empty() {
                let pick = ready[rand::thread_rng().gen_range(0..ready.len())];
                match self.commit_case(&mut g, &cases[pick], pick)? {
                    Ok(Some(out)) => return Ok(Ok(out)),
                    // The committed rendezvous fell through; rescan.
                    Ok(None) => continue,
                    Err(msg) => return Ok(Err(msg)),
                }
            }
            if !blocking {
                return Ok(Ok(SelectOutcome { index: cases.len(), recv: None }));
            }
            // Register as a receive waiter on every receive arm so
            // rendezvous senders can see us.
            for case in &cases {
                if let RtCase::Recv { chan: Some(id) } = case {
                    Self::chan(&mut g, *id)?.recv_waiters += 1;
                }
            }
            if !advertised {
                advertised = true;
                self.wake(&mut g);
            }
            let parked = self.park(&mut g);
            for case in &cases {
                if let RtCase::Recv { chan: Some(id) } = case {
                    if let Ok(ch) = Self::chan(&mut g, *id) {
                        ch.recv_waiters -= 1;
                    }
                }
            }
            parked?;
        }
    }

    /// Fire one ready arm. `Ok(None)` means a rendezvous send woke
    /// without a taker and withdrew its offer; the caller rescans.
    fn commit_case(
        &self,
        g: &mut MutexGuard<'_, SchedInner>,
        case: &RtCase,
        index: usize,
    ) -> ChanResult<Option<SelectOutcome>> {
        match case {
            RtCase::Send { chan: Some(id), value } => {
                let ch = Self::chan(g, *id)?;
                if ch.closed {
                    return Ok(Err("send on closed channel".to_string()));
                }
                if ch.cap > 0 {
                    ch.buf.push_back(value.clone());
                    self.wake(g);
                    return Ok(Ok(Some(SelectOutcome { index, recv: None })));
                }
                // Rendezvous: post the offer for the waiting receiver and
                // park once. If the wakeup brings no taker, withdraw so
                // the other arms stay eligible.
                let offer_id = g.next_offer;
                g.next_offer += 1;
                let ch = Self::chan(g, *id)?;
                ch.offers.push_back(Offer { id: offer_id, value: value.clone() });
                self.wake(g);
                self.park(g)?;
                let ch = Self::chan(g, *id)?;
                if ch.taken.remove(&offer_id) {
                    return Ok(Ok(Some(SelectOutcome { index, recv: None })));
                }
                ch.offers.retain(|o| o.id != offer_id);
                if ch.closed {
                    return Ok(Err("send on closed channel".to_string()));
                }
                Ok(Ok(None))
            }
            RtCase::Recv { chan: Some(id) } => {
                let ch = Self::chan(g, *id)?;
                if let Some(v) = ch.buf.pop_front() {
                    self.wake(g);
                    return Ok(Ok(Some(SelectOutcome { index, recv: Some((v, true)) })));
                }
                if let Some(offer) = ch.offers.pop_front() {
                    ch.taken.insert(offer.id);
                    self.wake(g);
                    return Ok(Ok(Some(SelectOutcome {
                        index,
                        recv: Some((offer.value, true)),
                    })));
                }
                // Ready but empty means closed.
                let zero = ch.zero.clone();
                Ok(Ok(Some(SelectOutcome { index, recv: Some((zero, false)) })))
            }
            _ => Err(anyhow!("nil channel arm selected")),
        }
    }
}
