//! Integer factorization helpers for split-factor search spaces.

/// All positive divisors of `n` in ascending order. Empty for zero.
pub fn divisors(n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut candidate = 1;
    while candidate * candidate <= n {
        if n % candidate == 0 {
            small.push(candidate);
            if candidate * candidate != n {
                large.push(n / candidate);
            }
        }
        candidate += 1;
    }
    small.extend(large.into_iter().rev());
    small
}

/// Every ordered factorization of `extent` into exactly `parts` positive
/// factors, outer to inner, in lexicographic order.
pub fn factorizations(extent: usize, parts: usize) -> Vec<Vec<usize>> {
    if extent == 0 || parts == 0 {
        return Vec::new();
    }
    if parts == 1 {
        return vec![vec![extent]];
    }
    let mut result = Vec::new();
    for head in divisors(extent) {
        for mut tail in factorizations(extent / head, parts - 1) {
            tail.insert(0, head);
            result.push(tail);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_divisors() {
        assert_eq!(divisors(1), vec![1]);
        assert_eq!(divisors(12), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(divisors(16), vec![1, 2, 4, 8, 16]);
        assert!(divisors(0).is_empty());
    }

    #[test]
    fn test_factorizations_of_small_extent() {
        assert_eq!(
            factorizations(4, 2),
            vec![vec![1, 4], vec![2, 2], vec![4, 1]]
        );
        assert_eq!(factorizations(1, 3), vec![vec![1, 1, 1]]);
        assert!(factorizations(8, 0).is_empty());
    }

    #[test]
    fn test_factorizations_of_64_three_way() {
        let all = factorizations(64, 3);
        // Compositions of the exponent 6 into three non-negative parts.
        assert_eq!(all.len(), 28);
        assert!(all.iter().all(|f| f.iter().product::<usize>() == 64));
    }

    proptest! {
        #[test]
        fn test_factorizations_multiply_to_extent(extent in 1usize..400, parts in 1usize..4) {
            let all = factorizations(extent, parts);
            prop_assert!(!all.is_empty());
            for factors in all {
                prop_assert_eq!(factors.len(), parts);
                prop_assert!(factors.iter().all(|f| *f >= 1));
                prop_assert_eq!(factors.iter().product::<usize>(), extent);
            }
        }
    }
}
