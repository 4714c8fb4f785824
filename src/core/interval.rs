//! Prefix collapsing and interval encoding for interval-typed sets
//!
//! Interval sets hold sorted, non-overlapping half-open ranges. Each range is
//! written as a start element followed by an element flagged as interval end
//! at the first address past the range. A leading zero-address end element
//! marks the gap from the bottom of the address space to the first range.
//!
//! Prefixes are collapsed before encoding: sorted by address, grouped into
//! clusters sharing the leading byte, and within each cluster any prefix
//! contained in a shorter surviving prefix is dropped. A final sweep over the
//! sorted survivors removes containment that crosses cluster boundaries.

use crate::core::error::ValidationError;
use crate::core::set::SetElement;
use crate::core::types::Address;

/// Network mask of `prefix` bits over a field of `len` bytes
pub fn mask_bytes(prefix: u8, len: usize) -> Vec<u8> {
    let mut remaining = u32::from(prefix);
    (0..len)
        .map(|_| {
            let bits = remaining.min(8);
            remaining -= bits;
            if bits == 0 { 0 } else { 0xffu8 << (8 - bits) }
        })
        .collect()
}

/// Returns `true` if `candidate` lies within `container`.
///
/// Containment is reflexive: every prefix is a subnet of itself.
pub fn is_subnet(candidate: &Address, container: &Address) -> bool {
    if candidate.is_v6() != container.is_v6() || candidate.prefix_len() < container.prefix_len() {
        return false;
    }
    let a = candidate.octets();
    let b = container.octets();
    let mask = mask_bytes(container.prefix_len(), b.len());
    a.iter()
        .zip(&b)
        .zip(&mask)
        .all(|((a, b), m)| a & m == b & m)
}

/// First address past the prefix, `None` when the prefix reaches the top of the address space
pub fn interval_end(prefix: &Address) -> Option<Vec<u8>> {
    let mut bytes = prefix.octets();
    let mask = mask_bytes(prefix.prefix_len(), bytes.len());
    for (b, m) in bytes.iter_mut().zip(&mask) {
        *b |= !m;
    }
    for b in bytes.iter_mut().rev() {
        if *b == 0xff {
            *b = 0;
        } else {
            *b += 1;
            return Some(bytes);
        }
    }
    None
}

/// Collapses nested prefixes, returning survivors sorted by network address.
pub fn collapse(prefixes: &[Address]) -> Vec<Address> {
    let mut sorted = prefixes.to_vec();
    sorted.sort_by_key(Address::octets);

    let mut survivors = Vec::with_capacity(sorted.len());
    for cluster in sorted.chunk_by(|a, b| a.octets()[0] == b.octets()[0]) {
        let mut cluster = cluster.to_vec();
        cluster.sort_by_key(Address::prefix_len);

        let mut kept: Vec<Address> = Vec::with_capacity(cluster.len());
        for candidate in cluster {
            if !kept.iter().any(|k| is_subnet(&candidate, k)) {
                kept.push(candidate);
            }
        }
        survivors.extend(kept);
    }

    survivors.sort_by(|a, b| {
        a.network_octets()
            .cmp(&b.network_octets())
            .then(a.prefix_len().cmp(&b.prefix_len()))
    });

    let mut result: Vec<Address> = Vec::with_capacity(survivors.len());
    for prefix in survivors {
        match result.last() {
            Some(last) if is_subnet(&prefix, last) => {}
            _ => result.push(prefix),
        }
    }
    result
}

/// Builds interval set elements for a list of prefixes of one address family.
///
/// # Errors
///
/// Returns `Err` if the list mixes IPv4 and IPv6 prefixes.
pub fn build_interval_elements(prefixes: &[Address]) -> Result<Vec<SetElement>, ValidationError> {
    let Some(first) = prefixes.first() else {
        return Ok(Vec::new());
    };
    if prefixes.iter().any(|p| p.is_v6() != first.is_v6()) {
        return Err(ValidationError::AddressFamilyMismatch(
            "interval set mixes IPv4 and IPv6 prefixes".to_string(),
        ));
    }

    let collapsed = collapse(prefixes);
    let zero = vec![0u8; first.octets().len()];
    let mut elements = Vec::with_capacity(collapsed.len() * 2 + 1);

    if collapsed
        .first()
        .is_some_and(|p| p.network_octets() != zero)
    {
        elements.push(SetElement::interval_end(zero));
    }

    for prefix in &collapsed {
        let start = prefix.network_octets();
        // Adjacent ranges merge: drop the previous end instead of emitting a start at the same key.
        match elements.last() {
            Some(last) if last.interval_end && last.key == start => {
                elements.pop();
            }
            _ => elements.push(SetElement::new(start)),
        }
        if let Some(end) = interval_end(prefix) {
            elements.push(SetElement::interval_end(end));
        }
    }

    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<Address> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn names(list: &[Address]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_mask_bytes() {
        assert_eq!(mask_bytes(8, 4), vec![0xff, 0x00, 0x00, 0x00]);
        assert_eq!(mask_bytes(19, 4), vec![0xff, 0xff, 0xe0, 0x00]);
        assert_eq!(mask_bytes(0, 4), vec![0, 0, 0, 0]);
        assert_eq!(mask_bytes(32, 4), vec![0xff; 4]);
        assert_eq!(mask_bytes(64, 16)[7..9], [0xff, 0x00]);
    }

    #[test]
    fn test_subnet_containment() {
        let a = addrs(&["4.0.0.0/8", "4.4.0.0/16", "4.0.0.0/16", "4.4.0.0/19"]);
        assert!(is_subnet(&a[1], &a[0]));
        assert!(!is_subnet(&a[0], &a[1]));
        assert!(!is_subnet(&a[3], &a[2]));
        assert!(is_subnet(&a[0], &a[0]));
    }

    #[test]
    fn test_interval_end() {
        let a = addrs(&["1.0.0.0/8", "35.254.0.0/16", "10.0.0.1", "255.0.0.0/8"]);
        assert_eq!(interval_end(&a[0]), Some(vec![2, 0, 0, 0]));
        assert_eq!(interval_end(&a[1]), Some(vec![35, 255, 0, 0]));
        assert_eq!(interval_end(&a[2]), Some(vec![10, 0, 0, 2]));
        assert_eq!(interval_end(&a[3]), None);
    }

    #[test]
    fn test_collapse_to_single_supernet() {
        let input = addrs(&["4.4.4.0/24", "4.4.0.0/16", "4.0.0.0/8", "4.0.4.0/25"]);
        assert_eq!(names(&collapse(&input)), vec!["4.0.0.0/8"]);
    }

    #[test]
    fn test_collapse_keeps_disjoint_supernets() {
        let input = addrs(&["4.4.4.0/24", "4.4.0.0/16", "4.0.4.0/25", "4.0.0.0/16"]);
        let mut got = names(&collapse(&input));
        got.sort();
        assert_eq!(got, vec!["4.0.0.0/16", "4.4.0.0/16"]);
    }

    #[test]
    fn test_collapse_across_clusters() {
        let input = addrs(&["4.0.0.0/6", "5.1.0.0/16", "7.0.0.0/8", "9.0.0.0/8"]);
        assert_eq!(names(&collapse(&input)), vec!["4.0.0.0/6", "9.0.0.0/8"]);
    }

    #[test]
    fn test_interval_elements_layout() {
        let elements =
            build_interval_elements(&addrs(&["10.0.0.0/8", "192.168.1.0/24"])).unwrap();
        let expected = vec![
            SetElement::interval_end(vec![0, 0, 0, 0]),
            SetElement::new(vec![10, 0, 0, 0]),
            SetElement::interval_end(vec![11, 0, 0, 0]),
            SetElement::new(vec![192, 168, 1, 0]),
            SetElement::interval_end(vec![192, 168, 2, 0]),
        ];
        assert_eq!(elements, expected);
    }

    #[test]
    fn test_adjacent_prefixes_merge() {
        let elements =
            build_interval_elements(&addrs(&["10.0.0.0/24", "10.0.1.0/24"])).unwrap();
        assert_eq!(
            elements,
            vec![
                SetElement::interval_end(vec![0, 0, 0, 0]),
                SetElement::new(vec![10, 0, 0, 0]),
                SetElement::interval_end(vec![10, 0, 2, 0]),
            ]
        );
    }

    #[test]
    fn test_zero_start_and_top_end() {
        let elements = build_interval_elements(&addrs(&["0.0.0.0/8", "255.255.0.0/16"])).unwrap();
        assert_eq!(
            elements,
            vec![
                SetElement::new(vec![0, 0, 0, 0]),
                SetElement::interval_end(vec![1, 0, 0, 0]),
                SetElement::new(vec![255, 255, 0, 0]),
            ]
        );
    }

    #[test]
    fn test_mixed_families_rejected() {
        let mixed = addrs(&["10.0.0.0/8", "2001:db8::/32"]);
        assert!(matches!(
            build_interval_elements(&mixed),
            Err(ValidationError::AddressFamilyMismatch(_))
        ));
    }

    #[test]
    fn test_ipv6_interval() {
        let elements = build_interval_elements(&addrs(&["2001:db8::/32"])).unwrap();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[1].key[..4], [0x20, 0x01, 0x0d, 0xb8]);
        assert_eq!(elements[2].key[..4], [0x20, 0x01, 0x0d, 0xb9]);
        assert!(elements[2].interval_end);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::net::{IpAddr, Ipv4Addr};

        prop_compose! {
            fn arb_prefix()(octets in any::<[u8; 4]>(), len in 1u8..=32) -> Address {
                Address::new(IpAddr::V4(Ipv4Addr::from(octets)), Some(len)).unwrap()
            }
        }

        proptest! {
            #[test]
            fn test_elements_sorted_and_alternating(prefixes in prop::collection::vec(arb_prefix(), 1..40)) {
                let elements = build_interval_elements(&prefixes).unwrap();
                for pair in elements.windows(2) {
                    prop_assert!(pair[0].key < pair[1].key);
                    prop_assert_ne!(pair[0].interval_end, pair[1].interval_end);
                }
            }

            #[test]
            fn test_every_prefix_is_covered(prefixes in prop::collection::vec(arb_prefix(), 1..40)) {
                let collapsed = collapse(&prefixes);
                for prefix in &prefixes {
                    prop_assert!(collapsed.iter().any(|c| is_subnet(prefix, c)));
                }
            }
        }
    }
}
