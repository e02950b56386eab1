use std::hash::BuildHasher;

/// How an [`OpenTable`](crate::OpenTable) steps from a key's home slot to its later candidates.
///
/// Step `i` of a probe visits `(home + offset(i)) mod capacity`; step 0 is always the home slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Probing {
    /// `offset(i) = i`
    #[default]
    Linear,
    /// `offset(i) = c1·i + c2·i²`, computed with wrapping arithmetic.
    ///
    /// The first `capacity` steps visit every slot exactly once only if `c1` is odd and `c2` is
    /// even; an odd `c2` makes `c1·i + c2·i²` keep one parity and skip half the table.
    Quadratic { c1: usize, c2: usize },
}

impl Probing {
    /// Quadratic probing with constants drawn from `random_state`.
    ///
    /// `c1` is always odd and `c2` always even, so the sequence reaches every slot.
    pub fn random_quadratic<S: BuildHasher>(random_state: &S) -> Self {
        let c1 = random_state.hash_one(0x9e37_79b9_u32) as usize | 1;
        let c2 = random_state.hash_one(0x7f4a_7c15_u32) as usize & !1;
        Probing::Quadratic { c1, c2 }
    }

    /// Whether the first `capacity` steps from any home visit every slot of a power-of-two
    /// capacity.
    pub fn reaches_every_slot(self) -> bool {
        match self {
            Probing::Linear => true,
            Probing::Quadratic { c1, c2 } => c1 % 2 == 1 && c2 % 2 == 0,
        }
    }

    #[inline]
    pub(crate) fn offset(self, i: usize) -> usize {
        match self {
            Probing::Linear => i,
            Probing::Quadratic { c1, c2 } => c1
                .wrapping_mul(i)
                .wrapping_add(c2.wrapping_mul(i.wrapping_mul(i))),
        }
    }

    /// The slot visited at step `i` of a probe from `home`.
    #[inline]
    pub(crate) fn candidate(self, home: usize, i: usize, capacity: usize) -> usize {
        debug_assert!(capacity.is_power_of_two());
        home.wrapping_add(self.offset(i)) & (capacity - 1)
    }
}
