// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Embedding similarity math.
//!
//! Embedding generation lives behind the similarity service boundary;
//! this module only scores and normalizes vectors that arrive on the
//! wire.

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched dimensions or zero-norm inputs, which
/// keeps degenerate embeddings out of every threshold band.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// L2-normalize a vector in place.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Generate a deterministic embedding from a text hash.
///
/// Identical text always produces the identical vector, so tests can
/// script similarity outcomes without a real embedding model.
pub fn seeded_embedding(text: &str, dimension: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let seed = hasher.finish();

    let mut embedding = Vec::with_capacity(dimension);
    let mut state = seed;

    for _ in 0..dimension {
        state = state.wrapping_mul(0x5851f42d4c957f2d).wrapping_add(1);
        let val = (state as f32 / u64::MAX as f32) * 2.0 - 1.0;
        embedding.push(val);
    }

    normalize(&mut embedding);
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identity() {
        let v = seeded_embedding("Marcus", 64);
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_zero_norm() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_seeded_embedding_deterministic() {
        let a = seeded_embedding("Lyon", 128);
        let b = seeded_embedding("Lyon", 128);
        let c = seeded_embedding("Paris", 128);

        assert_eq!(a, b);
        assert!(cosine(&a, &c) < 0.99);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
