//! File conventions for intermediate and final data.
//!
//! Every process of a job derives the same names from `(job, mapper, reducer)`,
//! so mappers and reducers agree on where data lives without talking to each
//! other. Records are JSON objects written back to back, one per line.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use log::trace;

use crate::KeyValue;

/// Partition file written by `mapper` for `reducer`.
pub fn partition_name(dir: &Path, job: &str, mapper: usize, reducer: usize) -> PathBuf {
    dir.join(format!("mr.{}-{}-{}", job, mapper, reducer))
}

/// Output of one reduce task.
pub fn reduce_output_name(dir: &Path, job: &str, reducer: usize) -> PathBuf {
    dir.join(format!("mrtmp.{}-res-{}", job, reducer))
}

/// The merged, sorted result of a whole job.
pub fn merged_name(dir: &Path, job: &str) -> PathBuf {
    dir.join(format!("mrtmp.{}", job))
}

/// Hashes an intermediate key. The reduce bucket of a key is
/// `ihash(key) % n_reduce`.
pub fn ihash(key: &str) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() & 0x7fff_ffff) as u32
}

pub fn reducer_for(key: &str, n_reduce: usize) -> usize {
    ihash(key) as usize % n_reduce
}

/// Splits `kvs` into `n_reduce` buckets, keeping emission order inside each.
pub fn partition(kvs: Vec<KeyValue>, n_reduce: usize) -> Vec<Vec<KeyValue>> {
    let mut buckets = vec![Vec::new(); n_reduce];
    for kv in kvs {
        let r = reducer_for(&kv.key, n_reduce);
        buckets[r].push(kv);
    }
    buckets
}

pub fn write_records<W: Write>(w: &mut W, kvs: &[KeyValue]) -> io::Result<()> {
    for kv in kvs {
        serde_json::to_writer(&mut *w, kv)?;
        w.write_all(b"\n")?;
    }
    Ok(())
}

/// Decodes records until the stream is exhausted.
pub fn read_records<R: Read>(r: R) -> Result<Vec<KeyValue>> {
    serde_json::Deserializer::from_reader(r)
        .into_iter::<KeyValue>()
        .map(|kv| kv.context("malformed record"))
        .collect()
}

/// Appends records to a partition file, creating it when missing.
pub fn append_partition(path: &Path, kvs: &[KeyValue]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open partition file {:?}", path))?;
    let mut w = BufWriter::new(file);
    write_records(&mut w, kvs).with_context(|| format!("cannot write {:?}", path))?;
    w.flush()
        .with_context(|| format!("cannot write {:?}", path))?;
    trace!("appended {} records to {:?}", kvs.len(), path);
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Vec<KeyValue>> {
    let file = File::open(path).with_context(|| format!("cannot open {:?}", path))?;
    read_records(BufReader::new(file)).with_context(|| format!("cannot decode {:?}", path))
}

/// Atomically replaces `path` with the given records.
pub fn replace_file(path: &Path, kvs: &[KeyValue]) -> Result<()> {
    AtomicFile::new(path, AllowOverwrite)
        .write(|f| {
            let mut w = BufWriter::new(f);
            write_records(&mut w, kvs)?;
            w.flush()
        })
        .with_context(|| format!("cannot write {:?}", path))
}

/// Combines every reducer output of `job` into one file of `key: value` lines
/// sorted by key, and returns its path.
///
/// A line is split at its first `": "` when read back, so keys containing
/// `": "` or a line break are rejected, as are values with a line break.
pub fn merge(dir: &Path, job: &str, n_reduce: usize) -> Result<PathBuf> {
    let mut merged = BTreeMap::new();
    for r in 0..n_reduce {
        for kv in read_file(&reduce_output_name(dir, job, r))? {
            ensure!(
                !kv.key.contains(": ") && !kv.key.contains('\n') && !kv.value.contains('\n'),
                "{:?} = {:?} cannot be written as a merged line",
                kv.key,
                kv.value
            );
            merged.insert(kv.key, kv.value);
        }
    }
    let path = merged_name(dir, job);
    AtomicFile::new(&path, AllowOverwrite)
        .write(|f| {
            let mut w = BufWriter::new(f);
            for (k, v) in merged.iter() {
                writeln!(w, "{}: {}", k, v)?;
            }
            w.flush()
        })
        .with_context(|| format!("cannot write {:?}", path))?;
    Ok(path)
}

/// Reads a merged file back into a map.
pub fn read_merged(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path).with_context(|| format!("cannot read {:?}", path))?;
    content
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.split_once(": ")
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .with_context(|| format!("malformed line {:?} in {:?}", l, path))
        })
        .collect()
}

/// Empties the partition files of a job so the next run starts clean.
/// Missing files are ignored.
pub fn truncate_partitions(dir: &Path, job: &str, n_map: usize, n_reduce: usize) -> Result<()> {
    for m in 0..n_map {
        for r in 0..n_reduce {
            let path = partition_name(dir, job, m, r);
            match OpenOptions::new().write(true).truncate(true).open(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("cannot truncate {:?}", path)),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_names_are_injective() {
        let dir = Path::new("/data");
        let mut seen = HashSet::new();
        for m in 0..12 {
            for r in 0..12 {
                assert!(seen.insert(partition_name(dir, "pagerank", m, r)));
            }
        }
        // "1-11" vs "11-1" must not collide.
        assert_ne!(
            partition_name(dir, "j", 1, 11),
            partition_name(dir, "j", 11, 1)
        );
        assert_ne!(reduce_output_name(dir, "a", 0), reduce_output_name(dir, "b", 0));
    }

    #[test]
    fn test_partition_is_deterministic() {
        let kvs: Vec<_> = ["A", "B", "C", "page-17", "", "ünïcode"]
            .iter()
            .map(|k| KeyValue::new(*k, "1"))
            .collect();
        let first = partition(kvs.clone(), 4);
        let second = partition(kvs, 4);
        assert_eq!(first, second);
        for (r, bucket) in first.iter().enumerate() {
            for kv in bucket {
                assert_eq!(reducer_for(&kv.key, 4), r);
            }
        }
        assert!(ihash("anything") <= 0x7fff_ffff);
    }

    #[test]
    fn test_partition_keeps_order() {
        let kvs = vec![
            KeyValue::new("x", "1"),
            KeyValue::new("x", "2"),
            KeyValue::new("x", "3"),
        ];
        let buckets = partition(kvs.clone(), 1);
        assert_eq!(buckets, vec![kvs]);
    }

    #[test]
    fn test_read_tolerates_repeated_appends() {
        let dir = TempDir::new().unwrap();
        let path = partition_name(dir.path(), "j", 0, 0);
        append_partition(&path, &[KeyValue::new("a", "1")]).unwrap();
        append_partition(&path, &[]).unwrap();
        append_partition(&path, &[KeyValue::new("b", "2"), KeyValue::new("a", "3")]).unwrap();
        let kvs = read_file(&path).unwrap();
        assert_eq!(
            kvs,
            vec![
                KeyValue::new("a", "1"),
                KeyValue::new("b", "2"),
                KeyValue::new("a", "3")
            ]
        );
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken");
        fs::write(&path, "{\"key\":\"a\",\"value\":\"1\"}\n{\"key\":").unwrap();
        assert!(read_file(&path).is_err());
        fs::write(&path, "not json\n").unwrap();
        assert!(read_file(&path).is_err());
    }

    #[test]
    fn test_merge_sorts_and_is_repeatable() {
        let dir = TempDir::new().unwrap();
        replace_file(
            &reduce_output_name(dir.path(), "j", 0),
            &[KeyValue::new("b", "2"), KeyValue::new("C", "3")],
        )
        .unwrap();
        replace_file(&reduce_output_name(dir.path(), "j", 1), &[KeyValue::new("a", "1")]).unwrap();

        let path = merge(dir.path(), "j", 2).unwrap();
        let first = fs::read(&path).unwrap();
        assert_eq!(String::from_utf8(first.clone()).unwrap(), "C: 3\na: 1\nb: 2\n");
        let again = merge(dir.path(), "j", 2).unwrap();
        assert_eq!(path, again);
        assert_eq!(fs::read(&again).unwrap(), first);

        let parsed = read_merged(&path).unwrap();
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_merge_rejects_ambiguous_keys() {
        let dir = TempDir::new().unwrap();
        for bad in [KeyValue::new("a: b", "1"), KeyValue::new("a\nb", "1"), KeyValue::new("a", "1\n2")] {
            replace_file(&reduce_output_name(dir.path(), "j", 0), &[bad]).unwrap();
            assert!(merge(dir.path(), "j", 1).is_err());
        }
        // A colon without the following space still reads back.
        replace_file(&reduce_output_name(dir.path(), "j", 0), &[KeyValue::new("a:b", "x: y")]).unwrap();
        let path = merge(dir.path(), "j", 1).unwrap();
        assert_eq!(read_merged(&path).unwrap()["a:b"], "x: y");
    }

    #[test]
    fn test_merge_requires_every_output() {
        let dir = TempDir::new().unwrap();
        replace_file(&reduce_output_name(dir.path(), "j", 0), &[]).unwrap();
        assert!(merge(dir.path(), "j", 2).is_err());
    }

    #[test]
    fn test_truncate_partitions() {
        let dir = TempDir::new().unwrap();
        let path = partition_name(dir.path(), "j", 1, 0);
        append_partition(&path, &[KeyValue::new("a", "1")]).unwrap();
        // (0, 0) and (1, 1) were never written.
        truncate_partitions(dir.path(), "j", 2, 2).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(!partition_name(dir.path(), "j", 0, 0).exists());
    }
}
