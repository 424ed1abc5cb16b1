// This file is part of Sigchain and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use tracing::debug;

use super::{MerkleClient, MerkleError, MerkleRoot, MerkleUserLeaf};
use crate::ids::{Seqno, Uid};

/// Finds the earliest root whose leaf for `uid` is at chain seqno `target` or later.
///
/// `low` is a root already known to predate the target. Probes gallop forward
/// from `low + 1` with doubling steps until one reaches the target or the latest
/// known root, then binary-search the gap between the last short probe and the
/// first hit.
pub fn find_first_leaf_with_chain_seqno(
    client: &MerkleClient,
    uid: Uid,
    target: Seqno,
    low: Seqno,
) -> Result<(MerkleUserLeaf, MerkleRoot), MerkleError> {
    let latest = match client.last_seqno()? {
        Some(latest) => latest,
        None => client.fetch_current_root()?.seqno(),
    };
    if low >= latest {
        return Err(MerkleError::NotFound { target, latest });
    }

    let mut under = low;
    let mut step: Seqno = 1;
    let (mut over, mut found) = loop {
        let probe = low.saturating_add(step).min(latest);
        let (leaf, root) = client.lookup_leaf_at_seqno(uid, probe)?;
        debug!(%uid, probe, chain = leaf.public_seqno(), target, "galloping probe");
        if leaf.public_seqno() >= target {
            break (probe, (leaf, root));
        }
        if probe == latest {
            return Err(MerkleError::NotFound { target, latest });
        }
        under = probe;
        step = step.saturating_mul(2);
    };

    while over - under > 1 {
        let mid = under + (over - under) / 2;
        let (leaf, root) = client.lookup_leaf_at_seqno(uid, mid)?;
        debug!(%uid, probe = mid, chain = leaf.public_seqno(), target, "bisecting probe");
        if leaf.public_seqno() >= target {
            over = mid;
            found = (leaf, root);
        } else {
            under = mid;
        }
    }
    debug!(%uid, root = over, target, "first root with chain seqno");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::chain::testing::ChainBuilder;
    use crate::config::{Config, RunMode};
    use crate::context::Context;
    use crate::merkle::testing::MockDirectory;

    const FIRST_ROOT_WITH_TARGET: Seqno = 733;
    const TARGET: Seqno = 5;

    fn setup() -> (MerkleClient, Arc<MockDirectory>) {
        let mut config = Config::for_run_mode(RunMode::Devel);
        config.merkle_kids = Some(vec![ChainBuilder::signer(60).kid()]);
        let directory = Arc::new(MockDirectory::new(
            ChainBuilder::signer(60),
            "alice",
            1000,
            |root| {
                if root >= FIRST_ROOT_WITH_TARGET {
                    TARGET
                } else if root >= 100 {
                    TARGET - 1
                } else {
                    0
                }
            },
        ));
        let client =
            MerkleClient::new(Context::in_memory(config), directory.clone()).expect("client");
        client.fetch_current_root().expect("latest");
        (client, directory)
    }

    fn log2_ceil(value: Seqno) -> usize {
        let mut bits = 0;
        while (1 << bits) < value {
            bits += 1;
        }
        bits
    }

    #[test]
    fn finds_exact_root_from_any_lower_bound() {
        for low in [0, 1, 99, 500, 700, 731, 732] {
            let (client, directory) = setup();
            let (leaf, root) =
                find_first_leaf_with_chain_seqno(&client, directory.uid(), TARGET, low)
                    .expect("search");
            assert_eq!(root.seqno(), FIRST_ROOT_WITH_TARGET, "low {low}");
            assert_eq!(leaf.public_seqno(), TARGET);

            let bound = 2 * log2_ceil(1000 - low) + 2;
            let probes = directory.historical_probes();
            assert!(probes <= bound, "low {low}: {probes} probes > {bound}");
        }
    }

    #[test]
    fn unreached_target_is_not_found() {
        let (client, directory) = setup();
        assert!(matches!(
            find_first_leaf_with_chain_seqno(&client, directory.uid(), TARGET + 1, 0),
            Err(MerkleError::NotFound { latest: 1000, .. })
        ));
        assert!(matches!(
            find_first_leaf_with_chain_seqno(&client, directory.uid(), TARGET, 1000),
            Err(MerkleError::NotFound { .. })
        ));
    }

    #[test]
    fn next_root_hit_needs_one_probe() {
        let (client, directory) = setup();
        let (_, root) = find_first_leaf_with_chain_seqno(&client, directory.uid(), TARGET, 732)
            .expect("search");
        assert_eq!(root.seqno(), 733);
        assert_eq!(directory.historical_probes(), 1);
    }
}
