use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::GenerationParameters;

/// Shared stop signal between a waiting caller and a blocking generation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A loaded model able to turn a rendered prompt into raw decoded text.
///
/// Implementations must be safe to call from several threads at once; the
/// pipeline shares one instance across all concurrent generations.
pub trait TextGenerator: std::fmt::Debug + Send + Sync {
    /// Returns the decoded prompt and continuation with special tokens kept.
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        cancel: &CancelFlag,
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let flag = CancelFlag::new();
        let seen_by_worker = flag.clone();
        assert!(!seen_by_worker.is_cancelled());
        flag.cancel();
        assert!(seen_by_worker.is_cancelled());
    }
}
