//! Message processors
//!
//! A processor owns one piece of state and updates it from the messages of
//! one kind. The listener hands every decoded envelope to the processors
//! registered for its kind, then to those registered for any kind.
//!
//! Every processor runs its update between two optional hooks:
//!
//! ```text
//! pre_process(envelope) -> false ? skip : apply(envelope) -> outcome -> post_process(envelope, outcome)
//! ```
//!
//! Hooks run outside the processor's state lock, so a failing hook never
//! leaves a half-applied table behind.

pub mod availability;
pub mod subscription;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use anyhow::Result;
use shared::message::{Envelope, MessageKind};

pub use availability::{AvailabilityProcessor, ChangeNotifier, Transition};
pub use subscription::SubscriptionProcessor;

/// Which envelopes a processor wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accepts {
    /// Every envelope regardless of payload
    Any,
    Kind(MessageKind),
}

pub trait MessageProcessor: Send + Sync {
    fn accepts(&self) -> Accepts;

    /// Apply one envelope. Errors are reported to the caller after any
    /// state change has been committed.
    fn process(&self, envelope: &Envelope) -> Result<()>;
}

pub type PreProcess = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;
pub type PostProcess<O> = Arc<dyn Fn(&Envelope, &O) -> Result<()> + Send + Sync>;

/// Optional pre/post callbacks around a processor's update. `O` is what the
/// update reports to the post hook.
pub struct Hooks<O> {
    pre_process: RwLock<Option<PreProcess>>,
    post_process: RwLock<Option<PostProcess<O>>>,
}

impl<O> Default for Hooks<O> {
    fn default() -> Self {
        Self {
            pre_process: RwLock::new(None),
            post_process: RwLock::new(None),
        }
    }
}

impl<O> Hooks<O> {
    /// Envelopes for which `filter` returns false are skipped entirely
    pub fn set_pre_process(&self, filter: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        *self.pre_process.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(filter));
    }

    pub fn set_post_process(
        &self,
        hook: impl Fn(&Envelope, &O) -> Result<()> + Send + Sync + 'static,
    ) {
        *self.post_process.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Run `apply` between the hooks
    pub fn run(&self, envelope: &Envelope, apply: impl FnOnce() -> Result<O>) -> Result<()> {
        let pre = self.pre_process.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(pre) = pre {
            if !pre(envelope) {
                return Ok(());
            }
        }

        let outcome = apply()?;

        let post = self.post_process.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(post) = post {
            post(envelope, &outcome)?;
        }
        Ok(())
    }
}

/// A processor defined by a closure
pub struct FnProcessor {
    accepts: Accepts,
    hooks: Hooks<()>,
    apply: Box<dyn Fn(&Envelope) -> Result<()> + Send + Sync>,
}

impl FnProcessor {
    pub fn new(
        accepts: Accepts,
        apply: impl Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            accepts,
            hooks: Hooks::default(),
            apply: Box::new(apply),
        }
    }

    pub fn hooks(&self) -> &Hooks<()> {
        &self.hooks
    }
}

impl MessageProcessor for FnProcessor {
    fn accepts(&self) -> Accepts {
        self.accepts
    }

    fn process(&self, envelope: &Envelope) -> Result<()> {
        self.hooks.run(envelope, || (self.apply)(envelope))
    }
}

/// Lock a table, recovering it if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use shared::message::SubscriptionMessage;

    fn envelope() -> Envelope {
        Envelope::new(SubscriptionMessage::subscribe(vec!["a".to_string()], "q"))
    }

    fn counting() -> (Arc<AtomicUsize>, FnProcessor) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let processor = FnProcessor::new(Accepts::Any, move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, processor)
    }

    #[test]
    fn test_pre_process_filters() {
        let (count, processor) = counting();
        processor.hooks().set_pre_process(|_| false);
        processor.process(&envelope()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        processor.hooks().set_pre_process(|_| true);
        processor.process(&envelope()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_process_runs_after_update() {
        let (count, processor) = counting();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (c, s) = (count.clone(), seen.clone());
        processor.hooks().set_post_process(move |_, _| {
            s.store(c.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        });

        processor.process(&envelope()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_post_process_keeps_update() {
        let (count, processor) = counting();
        processor.hooks().set_post_process(|_, _| anyhow::bail!("hook failed"));

        assert!(processor.process(&envelope()).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
