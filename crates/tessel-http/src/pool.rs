use std::io::{Read, Write};

use thunderdome::{Arena, Index};
use tracing::{event, instrument, Level};

use crate::{
    call::{CallOptions, HeadStatus, HttpServerCall},
    channel::{Channel, Ready},
};

/// Identifier of a call checked out of a `CallPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    index: Index,
}

/// Arena of recyclable calls.
///
/// Idle calls are kept on free lists keyed by the confidentiality of the channel they last
/// served. A call is only ever checked out to one connection at a time.
pub struct CallPool<S> {
    options: CallOptions,
    calls: Arena<Slot<S>>,
    free: [Vec<Index>; 2],
}

struct Slot<S> {
    call: HttpServerCall<S>,
    checked_out: bool,
}

impl<S> CallPool<S>
where
    S: Read + Write,
{
    pub fn new(options: CallOptions) -> Self {
        Self::with_capacity(options, 0, 0)
    }

    /// Create a pool with idle calls allocated up front.
    pub fn with_capacity(options: CallOptions, plain: usize, confidential: usize) -> Self {
        let mut this = Self {
            options,
            calls: Arena::with_capacity(plain + confidential),
            free: [Vec::with_capacity(plain), Vec::with_capacity(confidential)],
        };

        for (list, count) in [(false, plain), (true, confidential)] {
            for _ in 0..count {
                let index = this.insert_idle();
                this.free[list as usize].push(index);
            }
        }

        this
    }

    fn insert_idle(&mut self) -> Index {
        let slot = Slot {
            call: HttpServerCall::new(&self.options),
            checked_out: false,
        };
        self.calls.insert(slot)
    }

    /// Check out a call for a new connection, and start reading its request head.
    #[instrument("CallPool::acquire", level = "debug", skip_all)]
    pub fn acquire(
        &mut self,
        channel: Channel<S>,
        ready: Ready,
        initial: &[u8],
    ) -> (CallId, HeadStatus) {
        let list = channel.is_confidential() as usize;

        let index = match self.free[list].pop() {
            Some(index) => index,
            None => {
                event!(
                    Level::DEBUG,
                    confidential = list == 1,
                    "pool empty, allocating call"
                );
                self.insert_idle()
            }
        };

        // Free lists only ever contain indices of slots in the arena
        let slot = &mut self.calls[index];
        slot.checked_out = true;
        let status = slot.call.acquire(channel, ready, initial);

        (CallId { index }, status)
    }

    /// Get a checked out call.
    pub fn get(&self, id: CallId) -> Option<&HttpServerCall<S>> {
        self.calls
            .get(id.index)
            .filter(|slot| slot.checked_out)
            .map(|slot| &slot.call)
    }

    /// Get a checked out call mutably.
    pub fn get_mut(&mut self, id: CallId) -> Option<&mut HttpServerCall<S>> {
        self.calls
            .get_mut(id.index)
            .filter(|slot| slot.checked_out)
            .map(|slot| &mut slot.call)
    }

    /// Recycle a call and return it to the pool.
    ///
    /// Returns the channel the call was bound to, if it wasn't detached already.
    #[instrument("CallPool::release", level = "debug", skip_all)]
    pub fn release(&mut self, id: CallId) -> Option<Channel<S>> {
        let Some(slot) = self.calls.get(id.index) else {
            event!(Level::WARN, "released call not in pool");
            return None;
        };

        if !slot.checked_out {
            event!(Level::WARN, "released call that isn't checked out");
            return None;
        }

        // Re-inserting bumps the generation, ids handed out earlier stop resolving
        let mut slot = self.calls.remove(id.index)?;
        let list = slot.call.is_confidential() as usize;
        let channel = slot.call.detach();
        slot.call.recycle();
        slot.checked_out = false;

        let index = self.calls.insert(slot);
        self.free[list].push(index);

        channel
    }

    /// Amount of calls currently checked out.
    pub fn checked_out(&self) -> usize {
        self.calls.len() - self.free[0].len() - self.free[1].len()
    }

    /// Amount of idle calls kept for channels of the given confidentiality.
    pub fn available(&self, confidential: bool) -> usize {
        self.free[confidential as usize].len()
    }
}
