use std::panic;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::cpu::{mycpu, set_this_cpu, Cpu};

/// What a suspended thread is told when it is handed the core again.
pub(crate) enum Resume {
    /// Continue running on this core.
    Run(Arc<Cpu>),
    /// The process was reaped while switched out; unwind the thread.
    Reap,
}

/// Unwind payload used to retire the thread of a reaped process.
pub(crate) struct Reaped;

/// Saved execution context of a kernel thread.
///
/// Each scheduler loop and each process owns one host thread; a context is
/// the baton that thread waits on while it is switched out. Exactly one
/// thread per core holds the baton at any time.
#[derive(Default)]
pub struct Context {
    slot: Mutex<Option<Resume>>,
    wake: Condvar,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Context::default())
    }

    fn resume(&self, resume: Resume) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(resume);
        self.wake.notify_one();
    }

    fn suspend(&self) -> Resume {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(resume) = slot.take() {
                return resume;
            }
            slot = self.wake.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Retire the (switched out) thread that owns this context.
    pub(crate) fn reap(&self) {
        self.resume(Resume::Reap);
    }
}

/// Save the current thread in `old` and hand the current core to `new`.
/// Returns when some core switches back to `old`, possibly a different one.
pub fn swtch(old: &Context, new: &Context) {
    new.resume(Resume::Run(mycpu()));
    match old.suspend() {
        Resume::Run(cpu) => set_this_cpu(cpu),
        Resume::Reap => panic::resume_unwind(Box::new(Reaped)),
    }
}

/// Park a freshly created process thread until its first switch-in.
/// Returns `false` if the process was torn down before ever running.
pub(crate) fn wait_first_run(ctx: &Context) -> bool {
    match ctx.suspend() {
        Resume::Run(cpu) => {
            set_this_cpu(cpu);
            true
        }
        Resume::Reap => false,
    }
}

/// Start a host thread that will act as a kernel thread.
pub(crate) fn spawn_kernel_thread<F>(name: String, f: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f).map(|_| ())
}

/// Idle a core that found nothing to run.
pub(crate) fn relax() {
    thread::sleep(Duration::from_micros(50));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn swtch_hands_the_baton_back_and_forth() {
        let a = Context::new();
        let b = Context::new();
        let (tx, rx) = mpsc::channel();

        let (a2, b2) = (a.clone(), b.clone());
        spawn_kernel_thread("b".into(), move || {
            assert!(wait_first_run(&b2));
            tx.send("b ran").unwrap();
            swtch(&b2, &a2);
            tx.send("b ran again").unwrap();
            a2.resume(Resume::Run(mycpu()));
        })
        .unwrap();

        swtch(&a, &b);
        assert_eq!(rx.recv().unwrap(), "b ran");
        swtch(&a, &b);
        assert_eq!(rx.recv().unwrap(), "b ran again");
    }

    #[test]
    fn reap_before_first_run_ends_thread() {
        let ctx = Context::new();
        let (tx, rx) = mpsc::channel();
        let ctx2 = ctx.clone();
        spawn_kernel_thread("never".into(), move || {
            tx.send(wait_first_run(&ctx2)).unwrap();
        })
        .unwrap();
        ctx.reap();
        assert!(!rx.recv().unwrap());
    }
}
