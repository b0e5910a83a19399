//! MapReduce applications shipped with the framework.

use crate::{MapFn, ReduceFn};

pub mod pagerank;
pub mod wc;

/// Looks up an application's map and reduce functions by name.
pub fn by_name(name: &str) -> Option<(MapFn, ReduceFn)> {
    match name {
        "pagerank" => Some((pagerank::map, pagerank::reduce)),
        "wc" => Some((wc::map, wc::reduce)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_name() {
        assert!(by_name("pagerank").is_some());
        assert!(by_name("wc").is_some());
        assert!(by_name("grep").is_none());
    }
}
