use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide operational override. While engaged every turn is granted
/// without contacting the inference service.
#[derive(Debug, Default)]
pub struct KillSwitch {
    engaged: AtomicBool,
}

impl KillSwitch {
    pub fn new(engaged: bool) -> Self {
        Self {
            engaged: AtomicBool::new(engaged),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Returns the previous state.
    pub fn set(&self, engaged: bool) -> bool {
        let previous = self.engaged.swap(engaged, Ordering::SeqCst);
        if previous != engaged {
            tracing::warn!(
                target: "gate",
                engaged = engaged,
                "kill_switch_toggled"
            );
        }
        previous
    }
}
