use sha2::{Digest, Sha256};

use super::transaction::Transaction;

/// Computes the merkle root of an ordered transaction list.
///
/// Leaves are the transactions' canonical digests. Each level hashes adjacent
/// pairs; an odd level repeats its last node. No transactions hash to
/// `sha256("")`.
pub fn merkle_root(transactions: &[Transaction]) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = transactions.iter().map(Transaction::hash).collect();
    merkle_root_from_leaves(leaves)
}

/// Hex form of [`merkle_root`], as stored in block headers
pub fn merkle_root_hex(transactions: &[Transaction]) -> String {
    hex::encode(merkle_root(transactions))
}

fn merkle_root_from_leaves(mut level: Vec<[u8; 32]>) -> [u8; 32] {
    if level.is_empty() {
        return Sha256::digest(b"").into();
    }

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }

        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }

    level[0]
}
