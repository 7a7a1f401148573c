//! # Property Tests
//!
//! Drives the tree through randomized put/delete sequences against an
//! ordered-map model, checking the structural invariants (root black, no
//! red-red edge, uniform black height, strict key order) after every single
//! mutation. The delete rebalance in particular is validated this way rather
//! than by example cases alone.

use std::collections::BTreeMap;

use proptest::prelude::*;

use tanoak::Tree;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

// A tiny key alphabet keeps overwrite and delete collisions frequent.
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(b'a'..=b'e', 1..5)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), prop::collection::vec(any::<u8>(), 0..24))
            .prop_map(|(k, v)| Op::Put(k, v)),
        key_strategy().prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn tree_behaves_like_an_ordered_map(
        ops in prop::collection::vec(op_strategy(), 1..150),
    ) {
        let mut tree = Tree::heap(64).unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Put(key, value) => {
                    tree.put(key, value).unwrap();
                    model.insert(key.clone(), value.clone());
                }
                Op::Delete(key) => {
                    tree.delete(key).unwrap();
                    model.remove(key);
                }
            }

            tree.validate().unwrap();
        }

        prop_assert_eq!(tree.len().unwrap() as usize, model.len());
        for (key, value) in &model {
            prop_assert_eq!(tree.get(key).unwrap(), Some(value.as_slice()));
        }

        let mut entries = Vec::new();
        tree.for_each(|k, v| {
            entries.push((k.to_vec(), v.to_vec()));
            false
        })
        .unwrap();
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(entries, expected);
    }

    #[test]
    fn deleting_every_key_in_any_order_empties_the_tree(
        keys in prop::collection::btree_set(key_strategy(), 1..60),
        seed in any::<u64>(),
    ) {
        let mut tree = Tree::heap(64).unwrap();
        for key in &keys {
            tree.put(key, key).unwrap();
        }

        // Cheap deterministic shuffle of the deletion order.
        let mut order: Vec<_> = keys.into_iter().collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        for (remaining, key) in order.iter().enumerate() {
            tree.delete(key).unwrap();
            tree.validate().unwrap();
            prop_assert_eq!(tree.get(key).unwrap(), None);
            prop_assert_eq!(
                tree.len().unwrap() as usize,
                order.len() - remaining - 1
            );
        }

        prop_assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn checkouts_isolate_mutations_and_share_blobs(
        base in prop::collection::btree_map(key_strategy(), prop::collection::vec(any::<u8>(), 1..16), 1..30),
        edits in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let mut tree = Tree::heap(64).unwrap();
        for (key, value) in &base {
            tree.put(key, value).unwrap();
        }

        let mut checkout = tree.checkout().unwrap();
        let mut edited: BTreeMap<Vec<u8>, Vec<u8>> = base.clone();
        let mut touched = std::collections::BTreeSet::new();

        for op in &edits {
            match op {
                Op::Put(key, value) => {
                    tree.checkout_put(&mut checkout, key, value).unwrap();
                    edited.insert(key.clone(), value.clone());
                    touched.insert(key.clone());
                }
                Op::Delete(key) => {
                    tree.checkout_delete(&mut checkout, key).unwrap();
                    // A miss is a no-op and leaves the shared blob alone.
                    if edited.remove(key).is_some() {
                        touched.insert(key.clone());
                    }
                }
            }
        }

        // The source tree is byte-identical to its pre-checkout state.
        tree.validate().unwrap();
        prop_assert_eq!(tree.len().unwrap() as usize, base.len());
        for (key, value) in &base {
            prop_assert_eq!(tree.get(key).unwrap(), Some(value.as_slice()));

            // Untouched keys still share one physical blob with the checkout.
            let expected_refs = if touched.contains(key) { 1 } else { 2 };
            prop_assert_eq!(tree.value_refs(key).unwrap(), Some(expected_refs));
        }

        // The checkout matches the edited model.
        prop_assert_eq!(checkout.len() as usize, edited.len());
        for (key, value) in &edited {
            prop_assert_eq!(tree.checkout_get(&checkout, key).unwrap(), Some(value.as_slice()));
        }

        tree.discard_checkout(checkout).unwrap();
        for key in base.keys() {
            prop_assert_eq!(tree.value_refs(key).unwrap(), Some(1));
        }
    }
}
