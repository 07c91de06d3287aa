use std::collections::{BTreeMap, BTreeSet};

/// Observed bucket sums split against the declared output domain.
///
/// `in_domain` is the final bucket set of the noised result. `outside_domain`
/// holds buckets observed in reports but not declared by the job; they are
/// retained only for the unnoised debug view and never reach the noised
/// output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainReconciliation {
    pub in_domain: BTreeMap<u128, i64>,
    pub outside_domain: BTreeMap<u128, i64>,
    /// Every bucket that appeared in at least one accepted report, used to
    /// annotate the debug view.
    pub observed: BTreeSet<u128>,
}

/// Merges the accumulated sums with the job's declared output domain.
///
/// With a declared domain, the final bucket set is exactly the domain's
/// buckets, each with its accumulated sum or 0 if unobserved. Without one,
/// the observed bucket set itself is the domain.
#[must_use]
pub fn reconcile(
    observed: BTreeMap<u128, i64>,
    declared_domain: Option<&BTreeSet<u128>>,
) -> DomainReconciliation {
    let observed_buckets: BTreeSet<u128> = observed.keys().copied().collect();
    match declared_domain {
        None => DomainReconciliation {
            in_domain: observed,
            outside_domain: BTreeMap::new(),
            observed: observed_buckets,
        },
        Some(domain) => {
            let mut in_domain: BTreeMap<u128, i64> =
                domain.iter().map(|&bucket| (bucket, 0)).collect();
            let mut outside_domain = BTreeMap::new();
            for (bucket, sum) in observed {
                if let Some(slot) = in_domain.get_mut(&bucket) {
                    *slot = sum;
                } else {
                    outside_domain.insert(bucket, sum);
                }
            }
            DomainReconciliation {
                in_domain,
                outside_domain,
                observed: observed_buckets,
            }
        }
    }
}
