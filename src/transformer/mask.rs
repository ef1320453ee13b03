use crate::segmentation::Matte;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Single-slot holder for the most recent completed segmentation result.
///
/// Inference completions overwrite the slot; the draw path takes whatever
/// is there. After [`MaskRegister::dispose`] publishes are ignored.
#[derive(Default)]
pub struct MaskRegister {
    slot: Mutex<Option<Matte>>,
    disposed: AtomicBool,
}

impl MaskRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `matte`, replacing any result not yet drawn.
    ///
    /// Returns `false` when the register was disposed.
    pub fn publish(&self, matte: Matte) -> bool {
        // The flag is only set under the slot lock, so checking it here
        // cannot race with `dispose`.
        let mut slot = self.slot.lock();
        if self.is_disposed() {
            return false;
        }
        *slot = Some(matte);
        true
    }

    pub fn take(&self) -> Option<Matte> {
        self.slot.lock().take()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn dispose(&self) {
        let mut slot = self.slot.lock();
        self.disposed.store(true, Ordering::SeqCst);
        slot.take();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_result_overwrites_older() {
        let register = MaskRegister::new();
        register.publish(Matte::new(1, 1, vec![0.2]));
        register.publish(Matte::new(1, 1, vec![0.8]));
        assert_eq!(register.take().unwrap().data, vec![0.8]);
        assert!(register.take().is_none());
    }

    #[test]
    fn disposed_register_ignores_late_results() {
        let register = MaskRegister::new();
        register.dispose();
        assert!(!register.publish(Matte::new(1, 1, vec![1.0])));
        assert!(register.take().is_none());
    }

    #[test]
    fn dispose_during_concurrent_publishes_leaves_slot_empty() {
        use std::sync::Arc;

        for _ in 0..50 {
            let register = Arc::new(MaskRegister::new());
            let publishers: Vec<_> = (0..4)
                .map(|_| {
                    let register = Arc::clone(&register);
                    std::thread::spawn(move || {
                        while register.publish(Matte::new(1, 1, vec![0.5])) {}
                    })
                })
                .collect();

            std::thread::yield_now();
            register.dispose();
            for publisher in publishers {
                publisher.join().unwrap();
            }
            assert!(register.take().is_none());
        }
    }
}
