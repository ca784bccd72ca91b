//! Callback registration and dispatch.
//!
//! Registrations made before the server sync are parked in a staging table
//! and committed atomically when the session becomes ready, so no callback
//! ever observes a half-initialized replica. Dispatch hands jobs to a small
//! worker pool and never blocks the calling thread; a panicking callback is
//! logged and the worker keeps going.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::audio::queue::SoundChunk;
use crate::messages::{PermissionDeniedEvent, TextMessageEvent};
use crate::state::{AclView, Channel, ChannelDiff, User, UserDiff};

type Job = Box<dyn FnOnce() + Send + 'static>;
type Handler<T> = Option<Arc<T>>;

#[derive(Default, Clone)]
struct Handlers {
    on_connect: Handler<dyn Fn() + Send + Sync>,
    on_disconnect: Handler<dyn Fn() + Send + Sync>,
    on_channel_created: Handler<dyn Fn(Channel) + Send + Sync>,
    on_channel_updated: Handler<dyn Fn(Channel, ChannelDiff) + Send + Sync>,
    on_channel_removed: Handler<dyn Fn(Channel) + Send + Sync>,
    on_user_created: Handler<dyn Fn(User) + Send + Sync>,
    on_user_updated: Handler<dyn Fn(User, User, UserDiff) + Send + Sync>,
    on_user_removed: Handler<dyn Fn(User, Option<User>, bool, String) + Send + Sync>,
    on_message: Handler<dyn Fn(TextMessageEvent) + Send + Sync>,
    on_sound_received: Handler<dyn Fn(User, SoundChunk) + Send + Sync>,
    on_acl_received: Handler<dyn Fn(u32, AclView) + Send + Sync>,
    on_permission_denied: Handler<dyn Fn(PermissionDeniedEvent) + Send + Sync>,
}

pub struct Callbacks {
    staged: Mutex<Handlers>,
    active: Mutex<Handlers>,
    committed: AtomicBool,
    jobs: mpsc::UnboundedSender<Job>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

/// Registers `$register` into the staging table (write-through once ready)
/// and generates the crate-internal `$dispatch` counterpart.
macro_rules! event {
    ($register:ident, $dispatch:ident, ($($arg:ident: $ty:ty),*)) => {
        /// Register the handler; it takes effect when the session becomes
        /// ready (immediately, if it already is).
        pub fn $register(&self, handler: impl Fn($($ty),*) + Send + Sync + 'static) {
            let handler: Arc<dyn Fn($($ty),*) + Send + Sync> = Arc::new(handler);
            self.staged.lock().$register = Some(handler.clone());
            if self.committed.load(Ordering::Acquire) {
                self.active.lock().$register = Some(handler);
            }
        }

        pub(crate) fn $dispatch(&self, $($arg: $ty),*) {
            let handler = self.active.lock().$register.clone();
            if let Some(handler) = handler {
                self.submit(move || handler($($arg),*));
            }
        }
    };
}

impl Callbacks {
    pub fn new() -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        Callbacks {
            staged: Mutex::new(Handlers::default()),
            active: Mutex::new(Handlers::default()),
            committed: AtomicBool::new(false),
            jobs,
            pending: Mutex::new(Some(rx)),
        }
    }

    event!(on_connect, connected, ());
    event!(on_disconnect, disconnected, ());
    event!(on_channel_created, channel_created, (channel: Channel));
    event!(on_channel_updated, channel_updated, (channel: Channel, previous: ChannelDiff));
    event!(on_channel_removed, channel_removed, (channel: Channel));
    event!(on_user_created, user_created, (user: User));
    event!(on_user_updated, user_updated, (user: User, actor: User, previous: UserDiff));
    event!(on_user_removed, user_removed, (user: User, actor: Option<User>, ban: bool, reason: String));
    event!(on_message, message, (message: TextMessageEvent));
    event!(on_sound_received, sound_received, (user: User, chunk: SoundChunk));
    event!(on_acl_received, acl_received, (channel_id: u32, acl: AclView));
    event!(on_permission_denied, permission_denied, (event: PermissionDeniedEvent));

    /// Start the worker pool. Jobs dispatched earlier are queued and drain
    /// once the workers exist.
    pub fn spawn_workers(&self, count: usize) {
        let Some(rx) = self.pending.lock().take() else {
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..count.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!("callback panicked; continuing");
                            }
                        }
                        None => break,
                    }
                }
            });
        }
    }

    /// Commit staged registrations; runs when `ServerSync` opens the session.
    pub fn commit(&self) {
        *self.active.lock() = self.staged.lock().clone();
        self.committed.store(true, Ordering::Release);
    }

    fn submit(&self, job: impl FnOnce() + Send + 'static) {
        // Unbounded: dispatch must never block the dispatcher thread.
        let _ = self.jobs.send(Box::new(job));
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}
