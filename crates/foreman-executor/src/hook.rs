use async_trait::async_trait;
use foreman_core::{Lane, WpId};

/// Verdict from the governance/validation collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Proceed, but the concern is logged alongside the transition.
    Warn(String),
    /// The transition must not be recorded.
    Block(String),
}

/// Opaque governance hook consulted before sensitive transitions (review
/// exits in particular). The engine maps a [`Verdict::Block`] to a guard
/// rejection; the policy behind the verdict is out of scope here.
#[async_trait]
pub trait ValidationHook: Send + Sync {
    async fn verdict(&self, wp: &WpId, from: Lane, to: Lane) -> Verdict;
}

/// Permissive default hook.
pub struct NoopHook;

#[async_trait]
impl ValidationHook for NoopHook {
    async fn verdict(&self, _wp: &WpId, _from: Lane, _to: Lane) -> Verdict {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_hook_passes_everything() {
        let hook = NoopHook;
        let verdict = hook
            .verdict(&WpId::new("wp-1"), Lane::ForReview, Lane::Done)
            .await;
        assert_eq!(verdict, Verdict::Pass);
    }
}
