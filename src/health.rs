use crate::engines::BackendKind;
use crate::error::FailureKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Backends that returned a fatal failure and must not be tried again
/// until the process restarts.
#[derive(Debug, Default)]
pub struct BackendHealthRegistry {
    disabled: Mutex<HashMap<BackendKind, FailureKind>>,
}

impl BackendHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `kind` unusable. The first recorded reason is kept.
    pub fn disable(&self, kind: BackendKind, reason: FailureKind) {
        let mut disabled = self.disabled.lock();
        if !disabled.contains_key(&kind) {
            warn!("Disabling {} backend for the rest of this run: {}", kind, reason);
            disabled.insert(kind, reason);
        }
    }

    pub fn is_disabled(&self, kind: BackendKind) -> bool {
        self.disabled.lock().contains_key(&kind)
    }

    pub fn reason(&self, kind: BackendKind) -> Option<FailureKind> {
        self.disabled.lock().get(&kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_healthy() {
        let registry = BackendHealthRegistry::new();
        assert!(BackendKind::ALL.iter().all(|k| !registry.is_disabled(*k)));
    }

    #[test]
    fn keeps_first_reason() {
        let registry = BackendHealthRegistry::new();
        registry.disable(BackendKind::Remote, FailureKind::Unauthorized);
        registry.disable(BackendKind::Remote, FailureKind::QuotaExceeded);
        assert!(registry.is_disabled(BackendKind::Remote));
        assert_eq!(registry.reason(BackendKind::Remote), Some(FailureKind::Unauthorized));
        assert!(!registry.is_disabled(BackendKind::Office));
    }

    #[test]
    fn shared_across_threads() {
        let registry = Arc::new(BackendHealthRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.disable(BackendKind::Remote, FailureKind::QuotaExceeded))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.reason(BackendKind::Remote), Some(FailureKind::QuotaExceeded));
    }
}
