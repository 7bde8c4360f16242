use std::fmt;

/// Recommended maximum call depth if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;

/// Recommended largest list or string a single operation may build.
///
/// Counted in elements for lists and bytes for strings.
pub const DEFAULT_MAX_COLLECTION_LEN: usize = 10_000_000;

/// Default number of flush rounds one turn may take before the reactive graph is
/// declared cyclic.
pub const DEFAULT_MAX_FLUSH_ROUNDS: usize = 100;

/// Default nesting bound for effects that run while another effect is running
/// (nested reactive blocks, computed values read from effects).
pub const DEFAULT_MAX_EFFECT_DEPTH: usize = 128;

/// Error returned when a runtime resource limit is exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum instruction operations exceeded within one turn.
    Operation { limit: usize, count: usize },
    /// Maximum call depth exceeded.
    Recursion { limit: usize, depth: usize },
    /// An operation would build a list or string longer than allowed.
    Collection { limit: usize, len: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation { limit, count } => {
                write!(f, "operation limit exceeded: {count} > {limit}")
            }
            Self::Recursion { limit, .. } => {
                write!(f, "maximum call depth of {limit} exceeded")
            }
            Self::Collection { limit, len } => {
                write!(f, "collection size limit exceeded: {len} > {limit}")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

/// Bounds the reactive graph enforces on every turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReactiveLimits {
    /// How many times pending effects may be re-scheduled within one flush.
    pub max_flush_rounds: usize,
    /// How deeply effect runs may nest.
    pub max_effect_depth: usize,
}

impl Default for ReactiveLimits {
    fn default() -> Self {
        Self {
            max_flush_rounds: DEFAULT_MAX_FLUSH_ROUNDS,
            max_effect_depth: DEFAULT_MAX_EFFECT_DEPTH,
        }
    }
}

/// Limits applied to a running program.
///
/// Use `ResourceLimits::new()` for the recommended defaults and the builder methods
/// to adjust them. `Default` keeps the collection bound and lifts the others.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of instructions executed per turn.
    pub max_operations: Option<usize>,
    /// Maximum call depth (nested function frames plus nested block executions).
    pub max_recursion_depth: Option<usize>,
    /// Largest list (elements) or string (bytes) one operation may produce.
    pub max_collection_len: Option<usize>,
    pub reactive: ReactiveLimits,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_operations: None,
            max_recursion_depth: None,
            max_collection_len: Some(DEFAULT_MAX_COLLECTION_LEN),
            reactive: ReactiveLimits::default(),
        }
    }
}

impl ResourceLimits {
    /// Creates limits with no operation budget, the default call depth and the
    /// default collection bound.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, limit: Option<usize>) -> Self {
        self.max_recursion_depth = limit;
        self
    }

    #[must_use]
    pub fn max_collection_len(mut self, limit: Option<usize>) -> Self {
        self.max_collection_len = limit;
        self
    }

    #[must_use]
    pub fn max_flush_rounds(mut self, limit: usize) -> Self {
        self.reactive.max_flush_rounds = limit;
        self
    }

    #[must_use]
    pub fn max_effect_depth(mut self, limit: usize) -> Self {
        self.reactive.max_effect_depth = limit;
        self
    }
}

/// Counts operations against a [`ResourceLimits`] budget.
///
/// The operation counter is reset at the start of every host-initiated turn
/// (program start, signal write, event dispatch, remote delivery).
#[derive(Debug, Clone)]
pub struct ResourceTracker {
    limits: ResourceLimits,
    operations: usize,
}

impl ResourceTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits, operations: 0 }
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn start_turn(&mut self) {
        self.operations = 0;
    }

    #[inline]
    pub fn on_operation(&mut self) -> Result<(), ResourceError> {
        self.operations += 1;
        if let Some(limit) = self.limits.max_operations
            && self.operations > limit
        {
            return Err(ResourceError::Operation {
                limit,
                count: self.operations,
            });
        }
        Ok(())
    }

    pub fn check_depth(&self, depth: usize) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_recursion_depth
            && depth > limit
        {
            return Err(ResourceError::Recursion { limit, depth });
        }
        Ok(())
    }

    /// Checks the estimated length of a list or string before it is built.
    pub fn check_large_result(&self, estimated_len: usize) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_collection_len
            && estimated_len > limit
        {
            return Err(ResourceError::Collection {
                limit,
                len: estimated_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_budget_resets_per_turn() {
        let mut tracker = ResourceTracker::new(ResourceLimits::new().max_operations(2));
        assert!(tracker.on_operation().is_ok());
        assert!(tracker.on_operation().is_ok());
        assert_eq!(
            tracker.on_operation(),
            Err(ResourceError::Operation { limit: 2, count: 3 })
        );
        tracker.start_turn();
        assert!(tracker.on_operation().is_ok());
    }

    #[test]
    fn unlimited_depth() {
        let tracker = ResourceTracker::new(ResourceLimits::new().max_recursion_depth(None));
        assert!(tracker.check_depth(100_000).is_ok());
    }

    #[test]
    fn collection_bound_is_on_by_default() {
        let tracker = ResourceTracker::new(ResourceLimits::default());
        assert!(tracker.check_large_result(DEFAULT_MAX_COLLECTION_LEN).is_ok());
        assert_eq!(
            tracker.check_large_result(usize::MAX),
            Err(ResourceError::Collection {
                limit: DEFAULT_MAX_COLLECTION_LEN,
                len: usize::MAX,
            })
        );

        let lifted = ResourceTracker::new(ResourceLimits::new().max_collection_len(None));
        assert!(lifted.check_large_result(usize::MAX).is_ok());
    }
}
