// Proof of work
//
// A hash satisfies the proof of work when its leading bytes equal the required
// prefix. Difficulty is controlled purely by the prefix length; there is no
// numeric target comparison.

/// Checks whether `hash` satisfies the proof of work for `prefix`.
///
/// An empty prefix is satisfied by every hash. A prefix longer than the hash
/// can never be satisfied.
pub fn check_proof_of_work(prefix: &[u8], hash: &[u8]) -> bool {
    if prefix.is_empty() {
        return true;
    }

    hash.len() >= prefix.len() && &hash[..prefix.len()] == prefix
}

/// Builds a zero-byte prefix of the given length
pub fn difficulty_prefix(len: usize) -> Vec<u8> {
    vec![0u8; len]
}
