use std::{
    any::Any,
    cell::UnsafeCell,
    mem::{needs_drop, MaybeUninit},
    sync::atomic::{AtomicU8, Ordering},
};

// -----------------------------------------------------------------------------
// Call on drop guard

/// A guard that calls the specified closure when it is dropped. Used to run
/// cleanup on both the normal and the unwinding path.
pub struct CallOnDrop<F: FnMut()>(pub F);

impl<F: FnMut()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

// -----------------------------------------------------------------------------
// Slot

/// A slot is a lock-free cell that holds at most one value. Unlike `Option`,
/// a slot can be filled and emptied through a shared reference, so it can be
/// handed to every participant of a parallel region at once.
///
/// + `put` inserts a value into an empty slot, and gives the value back when
///   the slot is occupied. The first writer wins.
/// + `take` removes the value from an occupied slot.
///
/// Neither operation spins. A contended call simply fails.
pub struct Slot<T> {
    slot: UnsafeCell<MaybeUninit<T>>,
    flag: AtomicU8,
}

// The slot is empty. Allows `put` but not `take`.
const EMPTY: u8 = 0;

// A `put` or a `take` is in progress.
const BUSY: u8 = 1;

// The slot is occupied. Allows `take` but not `put`.
const FULL: u8 = 2;

impl<T> Slot<T> {
    /// Creates an empty slot.
    pub const fn empty() -> Slot<T> {
        Slot {
            slot: UnsafeCell::new(MaybeUninit::uninit()),
            flag: AtomicU8::new(EMPTY),
        }
    }

    /// Tries to put a value in the slot. Returns `None` on success, or gives
    /// the value back if the slot was occupied (or being written).
    pub fn put(&self, value: T) -> Option<T> {
        if self
            .flag
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Some(value);
        }
        // SAFETY: The `BUSY` flag gives us exclusive access to the cell.
        unsafe { (*self.slot.get()).write(value) };
        self.flag.store(FULL, Ordering::Release);
        None
    }

    /// Takes the value out of the slot, if there is one.
    pub fn take(&self) -> Option<T> {
        if self
            .flag
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // SAFETY: The `BUSY` flag gives us exclusive access to the cell, and
        // the `FULL` state we swapped out means the value is initialized.
        let value = unsafe { (*self.slot.get()).assume_init_read() };
        self.flag.store(EMPTY, Ordering::Release);
        Some(value)
    }

    /// Consumes the slot and returns its value.
    pub fn into_inner(self) -> Option<T> {
        self.take()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if needs_drop::<T>() && *self.flag.get_mut() == FULL {
            // SAFETY: A slot is never dropped mid-operation, and `FULL` means
            // the value is initialized.
            unsafe { self.slot.get_mut().assume_init_drop() };
        }
    }
}

// SAFETY: A `Slot<T>` owns at most one `T`.
unsafe impl<T: Send> Send for Slot<T> {}

// SAFETY: Sharing a slot lets other threads move a `T` in or out, which is
// exactly what `T: Send` permits.
unsafe impl<T: Send> Sync for Slot<T> {}

// -----------------------------------------------------------------------------
// Panic payloads

/// Extracts a human readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
