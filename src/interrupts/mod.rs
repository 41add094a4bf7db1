pub mod trap;

use crate::scheduler::cpu::mycpu;

/// Enable device interrupts on this core.
pub fn intr_on() {
    mycpu().set_interrupts(true);
}

/// Disable device interrupts on this core.
pub fn intr_off() {
    mycpu().set_interrupts(false);
}

/// Are device interrupts enabled on this core?
pub fn intr_get() -> bool {
    mycpu().interrupts_enabled()
}

/// Like `intr_off()`, but matched: it takes two `pop_off()`s to undo two
/// `push_off()`s. If interrupts were off to begin with, they stay off.
pub fn push_off() {
    let cpu = mycpu();
    let old = cpu.interrupts_enabled();
    cpu.set_interrupts(false);
    if cpu.noff() == 0 {
        cpu.set_intena(old);
    }
    cpu.set_noff(cpu.noff() + 1);
}

pub fn pop_off() {
    let cpu = mycpu();
    if cpu.interrupts_enabled() {
        panic!("pop_off - interruptible");
    }
    if cpu.noff() < 1 {
        panic!("pop_off");
    }
    cpu.set_noff(cpu.noff() - 1);
    if cpu.noff() == 0 && cpu.intena() {
        cpu.set_interrupts(true);
    }
}

/// Run `f` with interrupts disabled on this core.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    push_off();
    let ret = f();
    pop_off();
    ret
}
