use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Size of a (sub)tree, measured both in derivation depth and in produced
/// tokens. The generator keeps a mutable *current* size and an immutable
/// *limit*; at every rule boundary `current <= limit` must hold.
///
/// `usize::MAX` acts as the unbounded sentinel in both components, so all
/// arithmetic is saturating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RuleSize {
    pub depth: usize,
    pub tokens: usize,
}

impl RuleSize {
    pub const ZERO: Self = Self { depth: 0, tokens: 0 };

    /// The unbounded size, used as the default generation limit.
    pub const MAX: Self = Self {
        depth: usize::MAX,
        tokens: usize::MAX,
    };

    pub const fn new(depth: usize, tokens: usize) -> Self {
        Self { depth, tokens }
    }
}

/// Pointwise partial order: `a <= b` iff both components are `<=`.
impl PartialOrd for RuleSize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.depth.cmp(&other.depth), self.tokens.cmp(&other.tokens)) {
            (Ordering::Equal, ord) | (ord, Ordering::Equal) => Some(ord),
            (lhs, rhs) if lhs == rhs => Some(lhs),
            _ => None,
        }
    }
}

impl Add for RuleSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            depth: self.depth.saturating_add(rhs.depth),
            tokens: self.tokens.saturating_add(rhs.tokens),
        }
    }
}

impl AddAssign for RuleSize {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for RuleSize {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            depth: self.depth.saturating_sub(rhs.depth),
            tokens: self.tokens.saturating_sub(rhs.tokens),
        }
    }
}

impl SubAssign for RuleSize {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointwise_ordering_is_partial() {
        assert!(RuleSize::new(1, 2) <= RuleSize::new(1, 2));
        assert!(RuleSize::new(1, 2) <= RuleSize::new(2, 2));
        assert!(RuleSize::new(1, 2) < RuleSize::new(2, 3));
        // Incomparable pair: neither `<=` nor `>=`.
        assert!(!(RuleSize::new(1, 5) <= RuleSize::new(2, 3)));
        assert!(!(RuleSize::new(1, 5) >= RuleSize::new(2, 3)));
    }

    #[test]
    fn max_is_absorbing() {
        assert_eq!(RuleSize::MAX + RuleSize::new(1, 1), RuleSize::MAX);
        assert!(RuleSize::new(100, 100) <= RuleSize::MAX);
    }

    #[test]
    fn subtraction_saturates() {
        assert_eq!(
            RuleSize::new(1, 2) - RuleSize::new(5, 1),
            RuleSize::new(0, 1)
        );
    }
}
