// SPDX-License-Identifier: AGPL-3.0-only

//! FIFO slot lock
//!
//! Callers on the same subdevice are served strictly in the order they
//! arrived. A plain `Mutex` gives no such guarantee.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// Ticket lock around `T`
#[derive(Debug, Default)]
pub struct TicketLock<T> {
    tickets: Mutex<Tickets>,
    turn: Condvar,
    data: Mutex<T>,
}

impl<T> TicketLock<T> {
    /// Wrap `value`
    pub fn new(value: T) -> Self {
        Self {
            tickets: Mutex::new(Tickets::default()),
            turn: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Take a ticket and block until it is served
    pub fn lock(&self) -> TicketGuard<'_, T> {
        let mut t = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let mine = t.next;
        t.next += 1;
        while t.serving != mine {
            t = self.turn.wait(t).unwrap_or_else(PoisonError::into_inner);
        }
        drop(t);

        // Only the ticket holder reaches this point, so the mutex is free
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        TicketGuard {
            lock: self,
            data: Some(data),
        }
    }

    /// Callers holding or waiting for a ticket
    #[cfg(test)]
    fn queued(&self) -> u64 {
        let t = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        t.next - t.serving
    }
}

/// Access to the locked value; serves the next ticket on drop
#[derive(Debug)]
pub struct TicketGuard<'a, T> {
    lock: &'a TicketLock<T>,
    data: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for TicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Some until drop
        self.data.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data before handing over the turn
        self.data.take();
        let mut t = self.lock.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        t.serving += 1;
        drop(t);
        self.lock.turn.notify_all();
    }
}
