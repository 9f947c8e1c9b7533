use rand::seq::SliceRandom;
use tracing::debug;

use crate::uri::EndpointUri;

/// The broker addresses a failover transport may connect to. The most recently failed address
///  is tried last, but it stays eligible.
pub struct UriPool {
    uris: Vec<EndpointUri>,
    randomize: bool,
    last_failed: Option<EndpointUri>,
}

impl UriPool {
    pub fn new(uris: Vec<EndpointUri>, randomize: bool) -> UriPool {
        UriPool {
            uris,
            randomize,
            last_failed: None,
        }
    }

    pub fn uris(&self) -> &[EndpointUri] {
        &self.uris
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn add_uri(&mut self, uri: EndpointUri) {
        if !self.uris.contains(&uri) {
            debug!("adding broker address {}", uri);
            self.uris.push(uri);
        }
    }

    pub fn remove_uri(&mut self, uri: &EndpointUri) -> bool {
        let len_before = self.uris.len();
        self.uris.retain(|u| u != uri);
        if self.last_failed.as_ref() == Some(uri) {
            self.last_failed = None;
        }
        self.uris.len() != len_before
    }

    pub fn mark_failed(&mut self, uri: &EndpointUri) {
        self.last_failed = Some(uri.clone());
    }

    /// The addresses to try in the next reconnect round, in order
    pub fn candidates(&self) -> Vec<EndpointUri> {
        let mut result = self.uris.clone();
        if self.randomize {
            result.shuffle(&mut rand::thread_rng());
        }

        if let Some(last_failed) = &self.last_failed {
            if let Some(idx) = result.iter().position(|u| u == last_failed) {
                let failed = result.remove(idx);
                result.push(failed);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn uris(ports: &[u16]) -> Vec<EndpointUri> {
        ports.iter()
            .map(|&p| EndpointUri::tcp("broker", p))
            .collect()
    }

    #[rstest]
    #[case::none(&[1, 2, 3], None, &[1, 2, 3])]
    #[case::first_failed(&[1, 2, 3], Some(1), &[2, 3, 1])]
    #[case::middle_failed(&[1, 2, 3], Some(2), &[1, 3, 2])]
    #[case::last_failed(&[1, 2, 3], Some(3), &[1, 2, 3])]
    #[case::single(&[1], Some(1), &[1])]
    #[case::unknown_failed(&[1, 2], Some(9), &[1, 2])]
    fn test_candidates(#[case] ports: &[u16], #[case] failed: Option<u16>, #[case] expected: &[u16]) {
        let mut pool = UriPool::new(uris(ports), false);
        if let Some(failed) = failed {
            pool.mark_failed(&EndpointUri::tcp("broker", failed));
        }
        assert_eq!(pool.candidates(), uris(expected));
    }

    #[test]
    fn test_randomized_keeps_failed_last() {
        let mut pool = UriPool::new(uris(&[1, 2, 3, 4, 5]), true);
        pool.mark_failed(&EndpointUri::tcp("broker", 3));

        for _ in 0..20 {
            let candidates = pool.candidates();
            assert_eq!(candidates.len(), 5);
            assert_eq!(candidates[4], EndpointUri::tcp("broker", 3));
            for uri in uris(&[1, 2, 4, 5]) {
                assert!(candidates.contains(&uri));
            }
        }
    }

    #[test]
    fn test_add_remove() {
        let mut pool = UriPool::new(uris(&[1]), false);
        pool.add_uri(EndpointUri::tcp("broker", 2));
        pool.add_uri(EndpointUri::tcp("broker", 2));
        assert_eq!(pool.uris(), uris(&[1, 2]).as_slice());

        pool.mark_failed(&EndpointUri::tcp("broker", 1));
        assert!(pool.remove_uri(&EndpointUri::tcp("broker", 1)));
        assert!(!pool.remove_uri(&EndpointUri::tcp("broker", 1)));
        assert_eq!(pool.candidates(), uris(&[2]));
        assert!(!pool.is_empty());
    }
}
