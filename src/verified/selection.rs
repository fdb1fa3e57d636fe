//! Source and reduction target selection.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use rand::Rng;
use rand::seq::IteratorRandom;
use rand::seq::SliceRandom;

/// Pick a random copy source among the known locations.
pub fn choose_source<R: Rng + ?Sized>(known: &BTreeSet<String>, rng: &mut R) -> Option<String> {
    known.iter().choose(rng).cloned()
}

/// Pick `count` locations to remove a replica from.
///
/// `exclude` (typically the pool a fresh copy just landed on) is never
/// selected. Pools whose host already holds another selected-from replica
/// are preferred, so reductions first undo same-host placements. The result
/// may be shorter than `count` if there are not enough candidates.
pub fn select_reduction_targets<R, F>(
    known: &BTreeSet<String>,
    count: u32,
    exclude: Option<&str>,
    host_of: F,
    rng: &mut R,
) -> Vec<String>
where
    R: Rng + ?Sized,
    F: Fn(&str) -> Option<String>,
{
    let mut candidates: Vec<(String, String)> = known
        .iter()
        .filter(|pool| Some(pool.as_str()) != exclude)
        .map(|pool| {
            let host = host_of(pool).unwrap_or_else(|| pool.clone());
            (pool.clone(), host)
        })
        .collect();
    candidates.shuffle(rng);

    let mut per_host: BTreeMap<String, u32> = BTreeMap::new();
    for pool in known {
        let host = host_of(pool).unwrap_or_else(|| pool.clone());
        *per_host.entry(host).or_default() += 1;
    }

    let mut selected = Vec::new();
    while (selected.len() as u32) < count && !candidates.is_empty() {
        let index = candidates
            .iter()
            .position(|(_, host)| per_host.get(host).copied().unwrap_or(0) > 1)
            .unwrap_or(0);
        let (pool, host) = candidates.swap_remove(index);
        if let Some(n) = per_host.get_mut(&host) {
            *n = n.saturating_sub(1);
        }
        selected.push(pool);
    }
    selected
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn pools(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_choose_source_empty() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(choose_source(&BTreeSet::new(), &mut rng), None);
    }

    #[test]
    fn test_choose_source_single() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(choose_source(&pools(&["b"]), &mut rng).as_deref(), Some("b"));
    }

    #[test]
    fn test_reduction_respects_exclude_and_count() {
        let mut rng = StdRng::seed_from_u64(1);
        let known = pools(&["a", "b", "c", "d"]);
        let selected = select_reduction_targets(&known, 2, Some("a"), |p| Some(p.to_string()), &mut rng);
        assert_eq!(selected.len(), 2);
        assert!(!selected.contains(&"a".to_string()));
    }

    #[test]
    fn test_reduction_prefers_shared_hosts() {
        let known = pools(&["a", "b", "c"]);
        let host_of = |p: &str| match p {
            "a" | "b" => Some("h1".to_string()),
            _ => Some("h2".to_string()),
        };
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let selected = select_reduction_targets(&known, 1, None, host_of, &mut rng);
            assert_eq!(selected.len(), 1);
            assert_ne!(selected[0], "c", "seed {seed} removed the only copy on h2");
        }
    }

    #[test]
    fn test_reduction_short_when_not_enough_candidates() {
        let mut rng = StdRng::seed_from_u64(3);
        let selected = select_reduction_targets(&pools(&["a", "b"]), 5, Some("b"), |_| None, &mut rng);
        assert_eq!(selected, vec!["a".to_string()]);
    }
}
