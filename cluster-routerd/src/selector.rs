//! Instance selection policies

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use rand::seq::SliceRandom;
use shared::types::ServiceInstance;
use crate::config::SelectorKind;

/// Picks one instance out of a resolved set. Returns `None` only for an
/// empty slice; callers check for that first.
pub trait InstanceSelector: Send + Sync {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;
}

/// Uniform random choice
#[derive(Debug, Default)]
pub struct RandomSelector;

impl InstanceSelector for RandomSelector {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        instances.choose(&mut rand::thread_rng())
    }
}

/// Cycles through the set in order. The counter is shared across services,
/// so the rotation is only even per service when one service dominates.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl InstanceSelector for RoundRobinSelector {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        instances.get(index)
    }
}

pub fn from_kind(kind: SelectorKind) -> Arc<dyn InstanceSelector> {
    match kind {
        SelectorKind::Random => Arc::new(RandomSelector),
        SelectorKind::RoundRobin => Arc::new(RoundRobinSelector::default()),
    }
}
