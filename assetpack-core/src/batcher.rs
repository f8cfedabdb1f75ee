//! Greedy size-bounded batching of content items into package plans.
//!
//! Items are observed once, in source order. Each item either joins the
//! current batch, closes it and starts the next one, or (when it is larger
//! than the capacity on its own) is isolated into a singleton plan. The
//! batcher never reorders items; see [`crate::item::sort_by_size`] for the
//! optional pre-sort callers may apply first.

use crate::error::PackError;
use crate::item::ContentItem;

/// A group of items destined for one archive.
#[derive(Debug)]
pub struct PackagePlan {
    /// 1-based, assigned in emission order.
    pub index: u32,
    pub items: Vec<ContentItem>,
}

impl PackagePlan {
    pub fn total_size(&self) -> u64 {
        self.items
            .iter()
            .fold(0u64, |acc, item| acc.saturating_add(item.size_bytes))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True for the singleton plan created for an item larger than `capacity`.
    pub fn is_oversized(&self, capacity: u64) -> bool {
        self.items.len() == 1 && self.items[0].size_bytes > capacity
    }
}

/// Accumulator threaded through a single packing pass.
struct Batch {
    capacity: u64,
    items: Vec<ContentItem>,
    size: u64,
    next_index: u32,
    plans: Vec<PackagePlan>,
}

impl Batch {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            items: Vec::new(),
            size: 0,
            next_index: 1,
            plans: Vec::new(),
        }
    }

    fn push(&mut self, item: ContentItem) {
        if item.size_bytes > self.capacity {
            self.flush();
            self.emit(vec![item]);
            return;
        }

        // an overflowing sum exceeds any capacity
        let exceeds = self
            .size
            .checked_add(item.size_bytes)
            .map_or(true, |sum| sum > self.capacity);
        if !self.items.is_empty() && exceeds {
            self.flush();
        }

        // bounded by capacity: either it fit, or the batch was just emptied
        self.size += item.size_bytes;
        self.items.push(item);
    }

    fn flush(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.items);
        self.size = 0;
        self.emit(items);
    }

    fn emit(&mut self, items: Vec<ContentItem>) {
        self.plans.push(PackagePlan {
            index: self.next_index,
            items,
        });
        self.next_index += 1;
    }

    fn finish(mut self) -> Vec<PackagePlan> {
        self.flush();
        self.plans
    }
}

/// Partition `items` into plans whose declared sizes sum to at most
/// `capacity`, except for singleton plans holding an oversized item.
///
/// An empty input yields no plans.
pub fn pack<I>(items: I, capacity: u64) -> Result<Vec<PackagePlan>, PackError>
where
    I: IntoIterator<Item = ContentItem>,
{
    if capacity == 0 {
        return Err(PackError::InvalidCapacity);
    }

    let mut batch = Batch::new(capacity);
    for item in items {
        batch.push(item);
    }
    Ok(batch.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::item::MemoryContent;
    use proptest::prelude::*;

    fn item(name: &str, size: u64) -> ContentItem {
        ContentItem::new(name, size, Utc::now(), MemoryContent::new(Vec::new()))
    }

    fn shape(plans: &[PackagePlan]) -> Vec<(u32, Vec<String>)> {
        plans
            .iter()
            .map(|p| (p.index, p.items.iter().map(|i| i.virtual_path.clone()).collect()))
            .collect()
    }

    #[test]
    fn closes_batch_when_next_item_would_overflow() {
        let plans = pack(vec![item("A", 30), item("B", 40), item("C", 50)], 100).unwrap();
        assert_eq!(
            shape(&plans),
            vec![(1, vec!["A".into(), "B".into()]), (2, vec!["C".into()])]
        );
        assert_eq!(plans[0].total_size(), 70);
        assert_eq!(plans[1].total_size(), 50);
    }

    #[test]
    fn oversized_item_gets_its_own_plan() {
        let plans = pack(vec![item("A", 30), item("B", 150), item("C", 20)], 100).unwrap();
        assert_eq!(
            shape(&plans),
            vec![
                (1, vec!["A".into()]),
                (2, vec!["B".into()]),
                (3, vec!["C".into()]),
            ]
        );
        assert!(plans[1].is_oversized(100));
        assert!(!plans[0].is_oversized(100));
    }

    #[test]
    fn oversized_first_item_does_not_emit_empty_plan() {
        let plans = pack(vec![item("big", 500), item("small", 1)], 100).unwrap();
        assert_eq!(
            shape(&plans),
            vec![(1, vec!["big".into()]), (2, vec!["small".into()])]
        );
    }

    #[test]
    fn item_equal_to_capacity_fits() {
        let plans = pack(vec![item("A", 100)], 100).unwrap();
        assert_eq!(plans.len(), 1);
        assert!(!plans[0].is_oversized(100));
    }

    #[test]
    fn exact_fill_then_new_batch() {
        let plans = pack(vec![item("A", 60), item("B", 40), item("C", 1)], 100).unwrap();
        assert_eq!(
            shape(&plans),
            vec![(1, vec!["A".into(), "B".into()]), (2, vec!["C".into()])]
        );
    }

    #[test]
    fn zero_sized_items_share_a_batch() {
        let plans = pack(vec![item("A", 0), item("B", 0), item("C", 100)], 100).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].len(), 3);
    }

    #[test]
    fn empty_input_yields_no_plans() {
        let plans = pack(Vec::new(), 100).unwrap();
        assert!(plans.is_empty());
    }

    #[test]
    fn sum_past_u64_max_closes_batch() {
        let plans = pack(vec![item("a", u64::MAX - 1), item("b", 5)], u64::MAX).unwrap();
        assert_eq!(
            shape(&plans),
            vec![(1, vec!["a".into()]), (2, vec!["b".into()])]
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = pack(vec![item("A", 1)], 0).unwrap_err();
        assert!(matches!(err, PackError::InvalidCapacity));
    }

    fn size_strategy() -> impl Strategy<Value = u64> {
        prop_oneof![
            4 => 0u64..300,
            1 => (u64::MAX / 2 - 16)..=(u64::MAX / 2 + 16),
            1 => (u64::MAX - 300)..=u64::MAX,
        ]
    }

    fn capacity_strategy() -> impl Strategy<Value = u64> {
        prop_oneof![
            3 => 1u64..250,
            1 => (u64::MAX - 300)..=u64::MAX,
        ]
    }

    proptest! {
        #[test]
        fn packing_partitions_input_in_order(
            sizes in proptest::collection::vec(size_strategy(), 0..60),
            capacity in capacity_strategy(),
        ) {
            let items: Vec<_> = sizes.iter().enumerate().map(|(i, s)| item(&i.to_string(), *s)).collect();
            let plans = pack(items, capacity).unwrap();

            // every item exactly once, order preserved across plans
            let flattened: Vec<String> = plans.iter().flat_map(|p| p.items.iter().map(|i| i.virtual_path.clone())).collect();
            let expected: Vec<String> = (0..sizes.len()).map(|i| i.to_string()).collect();
            prop_assert_eq!(flattened, expected);

            for (pos, plan) in plans.iter().enumerate() {
                prop_assert_eq!(plan.index as usize, pos + 1);
                prop_assert!(!plan.is_empty());
                // u128 so an overflowing plan cannot hide behind saturation
                let exact: u128 = plan.items.iter().map(|i| u128::from(i.size_bytes)).sum();
                if plan.is_oversized(capacity) {
                    prop_assert_eq!(plan.len(), 1);
                } else {
                    prop_assert!(exact <= u128::from(capacity));
                }
                for it in &plan.items {
                    if it.size_bytes > capacity {
                        prop_assert_eq!(plan.len(), 1);
                    }
                }
            }
        }

        #[test]
        fn packing_is_deterministic(
            sizes in proptest::collection::vec(size_strategy(), 0..40),
            capacity in capacity_strategy(),
        ) {
            let build = || sizes.iter().enumerate().map(|(i, s)| item(&i.to_string(), *s)).collect::<Vec<_>>();
            let first = shape(&pack(build(), capacity).unwrap());
            let second = shape(&pack(build(), capacity).unwrap());
            prop_assert_eq!(first, second);
        }
    }
}
