//! Lock-free handoff of immutable configuration snapshots to a real-time thread.
//!
//! ```text
//!  root                                      tail (producer)
//!   │                                          │
//!   ▼                                          ▼
//! [cfg 1|abandoned] ─► [cfg 2|abandoned] ─► [cfg 3] ─► [cfg 4]
//!                                              ▲
//!                                        current (consumer)
//! ```
//!
//! The producer appends nodes and is the only party that frees memory: every
//! [`ConfigProducer::push`] first links the new node, then releases abandoned nodes
//! from the root. The consumer only follows `next` pointers and flags the nodes it
//! leaves behind, so polling never allocates, frees, or blocks.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::debug;

struct Node<T> {
    config: T,
    next: AtomicPtr<Node<T>>,
    abandoned: AtomicBool,
}

/// The node chain shared by a [`ConfigProducer`] and a [`ConfigConsumer`].
///
/// Created through [`channel`]; freed when both handles are gone.
pub struct ConfigHandoffQueue<T> {
    /// Oldest node not yet freed. Stored only by the producer.
    root: AtomicPtr<Node<T>>,
    _owns: PhantomData<Box<Node<T>>>,
}

impl<T> Drop for ConfigHandoffQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.root.get_mut();
        while !node.is_null() {
            // SAFETY: both handles are gone, so the chain is exclusively ours and every
            // node in it came from `Box::into_raw`.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

/// Create a connected producer/consumer pair.
pub fn channel<T>() -> (ConfigProducer<T>, ConfigConsumer<T>) {
    let queue = Arc::new(ConfigHandoffQueue {
        root: AtomicPtr::new(ptr::null_mut()),
        _owns: PhantomData,
    });
    (
        ConfigProducer {
            queue: Arc::clone(&queue),
            tail: ptr::null_mut(),
        },
        ConfigConsumer {
            queue,
            current: ptr::null_mut(),
        },
    )
}

/// Control-thread side: publishes new configurations and reclaims old ones.
pub struct ConfigProducer<T> {
    queue: Arc<ConfigHandoffQueue<T>>,
    /// Most recently pushed node; never abandoned because it has no successor.
    tail: *mut Node<T>,
}

// SAFETY: the handle is the only producer; payloads cross threads by value.
unsafe impl<T: Send> Send for ConfigProducer<T> {}

impl<T> ConfigProducer<T> {
    /// Publish `config` as the newest configuration, then free every node the
    /// consumer has moved past.
    pub fn push(&mut self, config: T) {
        let node = Box::into_raw(Box::new(Node {
            config,
            next: AtomicPtr::new(ptr::null_mut()),
            abandoned: AtomicBool::new(false),
        }));
        if self.tail.is_null() {
            self.queue.root.store(node, Ordering::Release);
        } else {
            // SAFETY: the tail has no successor, so the consumer cannot have abandoned
            // it and nobody else frees nodes.
            unsafe { (*self.tail).next.store(node, Ordering::Release) };
        }
        self.tail = node;
        self.reclaim();
    }

    fn reclaim(&mut self) {
        let mut freed = 0usize;
        loop {
            let root = self.queue.root.load(Ordering::Relaxed);
            if root.is_null() {
                break;
            }
            // SAFETY: nodes reachable from the root are alive until we free them here.
            let abandoned = unsafe { (*root).abandoned.load(Ordering::Acquire) };
            if !abandoned {
                break;
            }
            // SAFETY: an abandoned node always has a successor and the consumer no
            // longer touches it.
            let node = unsafe { Box::from_raw(root) };
            self.queue
                .root
                .store(node.next.load(Ordering::Relaxed), Ordering::Release);
            freed += 1;
        }
        if freed > 0 {
            debug!(freed, "reclaimed abandoned configurations");
        }
    }

    /// Nodes currently allocated, including the one the consumer is reading.
    pub fn live_nodes(&self) -> usize {
        let mut count = 0;
        let mut node = self.queue.root.load(Ordering::Relaxed);
        while !node.is_null() {
            count += 1;
            // SAFETY: only this handle frees nodes, so the chain is stable here.
            node = unsafe { (*node).next.load(Ordering::Acquire) };
        }
        count
    }
}

/// Real-time side: reads the current configuration without blocking.
pub struct ConfigConsumer<T> {
    queue: Arc<ConfigHandoffQueue<T>>,
    current: *mut Node<T>,
}

// SAFETY: the handle is the only consumer; it only ever reads payloads that the
// producer published and no longer touches.
unsafe impl<T: Send> Send for ConfigConsumer<T> {}

impl<T> ConfigConsumer<T> {
    /// Skip ahead to the newest configuration. `None` until the first push.
    pub fn poll(&mut self) -> Option<&T> {
        if !self.enter() {
            return None;
        }
        while self.step() {}
        self.latest()
    }

    /// Advance by at most one configuration, so every published value is observed.
    pub fn poll_1(&mut self) -> Option<&T> {
        if self.current.is_null() {
            self.enter();
        } else {
            self.step();
        }
        self.latest()
    }

    /// The configuration returned by the last poll, without advancing.
    pub fn latest(&self) -> Option<&T> {
        // SAFETY: the current node is never abandoned, so the producer keeps it alive.
        unsafe { self.current.as_ref() }.map(|node| &node.config)
    }

    /// Attach to the root on first use. Returns whether a node is current.
    fn enter(&mut self) -> bool {
        if self.current.is_null() {
            // Nothing is abandoned yet, so the root cannot move under us.
            self.current = self.queue.root.load(Ordering::Acquire);
        }
        !self.current.is_null()
    }

    /// Move to the successor of the current node, if one is published.
    fn step(&mut self) -> bool {
        // SAFETY: `current` is non-null and alive (see `latest`).
        let next = unsafe { (*self.current).next.load(Ordering::Acquire) };
        if next.is_null() {
            return false;
        }
        // SAFETY: as above; after this store the node belongs to the producer.
        unsafe { (*self.current).abandoned.store(true, Ordering::Release) };
        self.current = next;
        true
    }
}
