//! Splitting a manifest across chunk workers.

use crate::models::chunk::Partition;

/// Split `keys` into `ceil(len / target_chunk_size)` contiguous chunks whose
/// sizes differ by at most one.
///
/// Chunks are disjoint, keep manifest order, and concatenated in
/// `chunk_index` order they reproduce `keys` exactly. An empty manifest
/// yields no chunks. A `target_chunk_size` of zero is treated as one.
pub fn partition(keys: &[String], target_chunk_size: usize) -> Vec<Partition> {
    if keys.is_empty() {
        return Vec::new();
    }
    let target = target_chunk_size.max(1);
    let count = keys.len().div_ceil(target);
    let base = keys.len() / count;
    let remainder = keys.len() % count;

    let mut partitions = Vec::with_capacity(count);
    let mut start = 0;
    for chunk_index in 0..count {
        let len = base + usize::from(chunk_index < remainder);
        partitions.push(Partition {
            chunk_index: chunk_index as u32,
            keys: keys[start..start + len].to_vec(),
        });
        start += len;
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("galleries/g/originals/{i:05}.jpg")).collect()
    }

    #[test]
    fn two_hundred_fifty_keys_make_five_chunks_of_fifty() {
        let parts = partition(&keys(250), 50);
        assert_eq!(parts.len(), 5);
        assert!(parts.iter().all(|p| p.keys.len() == 50));
        assert_eq!(
            parts.iter().map(|p| p.chunk_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn uneven_split_differs_by_at_most_one() {
        let parts = partition(&keys(101), 50);
        let sizes: Vec<usize> = parts.iter().map(|p| p.keys.len()).collect();
        assert_eq!(sizes, vec![34, 34, 33]);
    }

    #[test]
    fn chunks_cover_manifest_exactly_once_in_order() {
        for total in [1, 2, 7, 49, 50, 51, 99, 100, 101, 250, 333] {
            for target in [1, 3, 10, 50, 64, 1000] {
                let manifest = keys(total);
                let parts = partition(&manifest, target);

                assert_eq!(parts.len(), total.div_ceil(target));
                let rejoined: Vec<String> =
                    parts.iter().flat_map(|p| p.keys.iter().cloned()).collect();
                assert_eq!(rejoined, manifest, "total={total} target={target}");

                let unique: HashSet<&String> = rejoined.iter().collect();
                assert_eq!(unique.len(), total);
                assert!(parts.iter().all(|p| !p.keys.is_empty()));
            }
        }
    }

    #[test]
    fn empty_manifest_and_zero_target() {
        assert!(partition(&[], 50).is_empty());
        assert_eq!(partition(&keys(3), 0).len(), 3);
    }
}
