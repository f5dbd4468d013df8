use crate::Error;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

/// Simple single producer, single consumer channel with credit.
///
/// The producer may only enqueue when the queue holds fewer than `bound` items.
/// Either side can dispose the channel, which drops (releases) every buffered
/// item exactly once and makes later sends fail.
pub(crate) fn channel<T>(bound: usize, weigh: fn(&T) -> usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Mutex::new(Inner::new(bound, weigh)));

    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

pub(crate) struct Receiver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

pub(crate) struct Sender<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

#[derive(Debug)]
pub(crate) enum TrySendError<T> {
    /// No credit left, wait for `poll_ready`.
    Full(T),
    /// Receiver is gone or the channel is disposed/ended.
    Closed(T),
}

fn lock<T>(inner: &Arc<Mutex<Inner<T>>>) -> MutexGuard<'_, Inner<T>> {
    // A panic while holding the lock leaves the queue itself consistent.
    match inner.lock() {
        Ok(l) => l,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T> Receiver<T> {
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<Result<T, Error>>> {
        let mut lock = lock(&self.inner);

        lock.poll_dequeue(cx)
    }

    /// Drop all buffered items and close the channel. Returns the number released.
    pub fn dispose(&mut self) -> usize {
        lock(&self.inner).dispose()
    }

    pub fn is_end(&self) -> bool {
        let lock = lock(&self.inner);
        lock.queue.is_empty() && lock.end.is_some()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut lock = lock(&self.inner);

        lock.rx_alive = false;
        // nobody will read these anymore.
        lock.dispose();
    }
}

impl<T> Sender<T> {
    pub fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        let mut lock = lock(&self.inner);
        lock.poll_ready(cx)
    }

    pub fn try_send(&mut self, t: T) -> Result<(), TrySendError<T>> {
        let mut lock = lock(&self.inner);

        if lock.is_closed() {
            return Err(TrySendError::Closed(t));
        }
        if lock.queue.len() >= lock.bound {
            return Err(TrySendError::Full(t));
        }

        lock.enqueue(t);

        Ok(())
    }

    /// Enqueue disregarding credit. Used where an outer flow control already
    /// bounds the amount of buffered data (HTTP/2 stream windows).
    pub fn force_send(&mut self, t: T) -> bool {
        let mut lock = lock(&self.inner);

        if lock.is_closed() {
            return false;
        }

        lock.enqueue(t);

        true
    }

    pub fn finish(&mut self) {
        let mut lock = lock(&self.inner);
        if lock.end.is_none() {
            lock.end = Some(End::Finished);
            lock.wake_all();
        }
    }

    pub fn fail(&mut self, e: Error) {
        let mut lock = lock(&self.inner);
        if lock.end.is_none() {
            lock.end = Some(End::Failed(Some(e)));
            lock.wake_all();
        }
    }

    pub fn dispose(&mut self) -> usize {
        lock(&self.inner).dispose()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).is_closed()
    }

    /// Weight of the items consumed by the receiver since the last call.
    pub fn poll_consumed(&mut self, cx: &mut Context) -> Poll<usize> {
        let mut lock = lock(&self.inner);

        if lock.consumed > 0 {
            let c = lock.consumed;
            lock.consumed = 0;
            Poll::Ready(c)
        } else {
            lock.register(cx);
            Poll::Pending
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut lock = lock(&self.inner);

        // no more items can arrive, dropping the sender ends the sequence.
        if lock.end.is_none() {
            lock.end = Some(End::Finished);
        }
        lock.wake_all();
    }
}

enum End {
    Finished,
    /// The error is handed to the receiver once, after which it reads as finished.
    Failed(Option<Error>),
}

struct Inner<T> {
    queue: VecDeque<T>,
    bound: usize,
    weigh: fn(&T) -> usize,
    consumed: usize,
    end: Option<End>,
    disposed: bool,
    rx_alive: bool,
    // We could have separate send and receive wakers. I feel like
    // that creates potential race conditions. In 99.9% of cases
    // there will only be one receiver and one sender anyway.
    wakers: Vec<Waker>,
}

impl<T> Inner<T> {
    fn new(bound: usize, weigh: fn(&T) -> usize) -> Self {
        Inner {
            queue: VecDeque::new(),
            bound: bound.max(1),
            weigh,
            consumed: 0,
            end: None,
            disposed: false,
            rx_alive: true,
            wakers: Vec::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.disposed || !self.rx_alive || self.end.is_some()
    }

    fn register(&mut self, cx: &mut Context) {
        if !self.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            self.wakers.push(cx.waker().clone());
        }
    }

    fn poll_ready(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        if self.is_closed() {
            return Poll::Ready(crate::err_closed());
        }
        if self.queue.len() >= self.bound {
            self.register(cx);
            Poll::Pending
        } else {
            Ok(()).into()
        }
    }

    fn enqueue(&mut self, t: T) {
        self.queue.push_back(t);
        self.wake_all();
    }

    fn poll_dequeue(&mut self, cx: &mut Context) -> Poll<Option<Result<T, Error>>> {
        if let Some(t) = self.queue.pop_front() {
            self.consumed += (self.weigh)(&t);
            self.wake_all();
            return Some(Ok(t)).into();
        }

        match &mut self.end {
            Some(End::Failed(e)) => {
                if let Some(e) = e.take() {
                    return Some(Err(e)).into();
                }
                None.into()
            }
            Some(End::Finished) => None.into(),
            None if self.disposed => None.into(),
            None => {
                self.register(cx);
                Poll::Pending
            }
        }
    }

    fn dispose(&mut self) -> usize {
        let count = self.queue.len();
        // dropping each item is what releases it.
        self.queue.clear();
        if !self.disposed {
            trace!("Dispose channel, released: {}", count);
        }
        self.disposed = true;
        self.wake_all();
        count
    }

    fn wake_all(&mut self) {
        for w in self.wakers.drain(..) {
            w.wake();
        }
    }
}
