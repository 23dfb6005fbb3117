//! # Lexical Hasher
//!
//! Produces two fingerprints over script text:
//!
//! - a per-logical-line hash, used to name the generated tables and
//!   prepared statements for the generator/condition/driver-output on
//!   that line (the "line-hash");
//! - a whole-script hash, used to name the on-disk database file
//!. The whole-script hash is commutative: reordering lines,
//!   or changing whitespace that does not change tokens, leaves it
//!   unchanged.
//!
//! The algorithm is FNV-1a applied byte-wise over each token. Lines are
//! combined into the whole-script hash by XOR alone — commutative and
//! associative, so line order never matters — with a single closing
//! multiply by the FNV prime applied once, in `ScriptHasher::finish`,
//! purely to spread the bits of the final accumulator.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Accumulates a fingerprint over the tokens of a single logical line.
#[derive(Debug, Clone, Copy)]
pub struct LineHasher {
    state: u32,
}

impl LineHasher {
    pub fn new() -> Self {
        LineHasher {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Fold one token's bytes into the line's running hash.
    pub fn feed_token(&mut self, token: &str) {
        for byte in token.as_bytes() {
            self.state ^= u32::from(*byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
        // A token separator byte keeps "ab" "c" from hashing identically
        // to "a" "bc".
        self.state ^= 0x1f;
        self.state = self.state.wrapping_mul(FNV_PRIME);
    }

    /// Finish this line and return its hash.
    pub fn finish(self) -> u32 {
        self.state
    }
}

impl Default for LineHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates the order-independent whole-script hash out of per-line
/// hashes as they are produced.
#[derive(Debug, Clone, Copy)]
pub struct ScriptHasher {
    state: u32,
}

impl ScriptHasher {
    pub fn new() -> Self {
        ScriptHasher { state: 0 }
    }

    /// Combine one more line's hash into the whole-script accumulator.
    /// XOR alone is commutative and associative, so line order never
    /// affects the result; the prime multiply is applied once in
    /// `finish()`, not per line, where it would break commutativity.
    pub fn feed_line(&mut self, line_hash: u32) {
        self.state ^= line_hash;
    }

    pub fn finish(self) -> u32 {
        self.state.wrapping_mul(FNV_PRIME)
    }
}

impl Default for ScriptHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a single token stream directly into a line-hash, for callers that
/// already have the tokens in hand rather than feeding them one at a time.
pub fn hash_line(tokens: &[&str]) -> u32 {
    let mut hasher = LineHasher::new();
    for token in tokens {
        hasher.feed_token(token);
    }
    hasher.finish()
}

/// Combine a set of line-hashes into the whole-script hash.
pub fn hash_script(line_hashes: &[u32]) -> u32 {
    let mut hasher = ScriptHasher::new();
    for &h in line_hashes {
        hasher.feed_line(h);
    }
    hasher.finish()
}

/// Render a hash as the lowercase 8-hex-digit form used in table and file
/// names (`gen_<linehash>`, `pulley_<hash>.sqlite3`-equivalents — see
/// [`crate::config::Config::db_file_name`]).
pub fn hash_hex(h: u32) -> String {
    format!("{h:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_script_hash_is_order_independent() {
        let lines_a = ["Mail:x <- world", "out(x) <- x"];
        let lines_b = ["out(x) <- x", "Mail:x <- world"];

        let hash = |lines: &[&str]| -> u32 {
            let line_hashes: Vec<u32> = lines
                .iter()
                .map(|l| hash_line(&l.split_whitespace().collect::<Vec<_>>()))
                .collect();
            hash_script(&line_hashes)
        };

        assert_eq!(hash(&lines_a), hash(&lines_b));
    }

    #[test]
    fn whitespace_changes_without_token_changes_are_stable() {
        let a = hash_line(&"Mail:x".split_whitespace().collect::<Vec<_>>());
        let b = hash_line(&"  Mail:x  ".split_whitespace().collect::<Vec<_>>());
        assert_eq!(a, b);
    }

    #[test]
    fn different_tokens_hash_differently() {
        assert_ne!(
            hash_line(&["Mail:x"]),
            hash_line(&["Mail:y"]),
            "distinct token sets should (almost always) collide only by chance"
        );
    }

    proptest::proptest! {
        #[test]
        fn hash_is_permutation_invariant(mut hashes: Vec<u32>) {
            let original = hash_script(&hashes);
            hashes.reverse();
            let reversed = hash_script(&hashes);
            proptest::prop_assert_eq!(original, reversed);
        }
    }
}
