//! In-process reference run of an application, without workers or files
//! other than the inputs.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::trace;

use crate::{MapFn, ReduceFn};

/// Maps every input, groups values by key in emission order and reduces each
/// group. The result is what a distributed run must merge to.
pub fn run(inputs: &[PathBuf], map: MapFn, reduce: ReduceFn) -> Result<BTreeMap<String, String>> {
    let mut groups = HashMap::<String, Vec<String>>::new();
    for input in inputs {
        let contents =
            fs::read_to_string(input).with_context(|| format!("cannot read {:?}", input))?;
        for kv in map(&input.to_string_lossy(), &contents) {
            groups.entry(kv.key).or_default().push(kv.value);
        }
        trace!("mapped {:?}", input);
    }
    Ok(groups
        .into_iter()
        .map(|(k, vs)| {
            let v = reduce(&k, &vs);
            (k, v)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wc;
    use tempfile::TempDir;

    #[test]
    fn test_sequential_wc() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "to be or not").unwrap();
        fs::write(&b, "to be").unwrap();
        let res = run(&[a, b], wc::map, wc::reduce).unwrap();
        assert_eq!(res["to"], "2");
        assert_eq!(res["not"], "1");
        assert_eq!(res.len(), 4);

        assert!(run(&[dir.path().join("absent")], wc::map, wc::reduce).is_err());
    }
}
