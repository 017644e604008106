/// An inclusive interval of packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketRange {
    pub lo: u32,
    pub hi: u32,
}

impl PacketRange {
    pub fn contains(&self, n: u32) -> bool {
        self.lo <= n && n <= self.hi
    }
}

/// A sorted list of disjoint inclusive ranges.
///
/// Invariant: ranges are sorted, `lo <= hi` for each, and consecutive ranges
/// never touch (`hi + 1 < next.lo`) - touching ranges are merged on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RangeSet {
    ranges: Vec<PacketRange>,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet::default()
    }

    pub fn as_slice(&self) -> &[PacketRange] {
        &self.ranges
    }

    /// Splices `n` into the set, merging with neighbouring ranges. Returns
    /// false - leaving the set untouched - if `n` was already covered.
    pub fn insert(&mut self, n: u32) -> bool {
        // index of the first range that could contain or follow n
        let idx = self.ranges.partition_point(|r| r.hi < n);
        let right = self.ranges.get(idx).copied();
        let left = idx.checked_sub(1).map(|i| self.ranges[i]);

        if let Some(right) = right {
            if right.contains(n) {
                return false;
            }
            if right.lo == n + 1 {
                if let Some(left) = left {
                    if left.hi + 1 == n {
                        // n bridges the gap between its neighbours
                        self.ranges[idx - 1] = PacketRange {
                            lo: left.lo,
                            hi: right.hi,
                        };
                        self.ranges.remove(idx);
                        return true;
                    }
                }
                self.ranges[idx].lo = n;
                return true;
            }
        }
        if let Some(left) = left {
            if left.hi + 1 == n {
                self.ranges[idx - 1].hi = n;
                return true;
            }
        }
        self.ranges.insert(idx, PacketRange { lo: n, hi: n });
        true
    }
}
