//! PageRank, one MapReduce job per iteration.
//!
//! Input lines look like `page: rank, out1, out2`. Each iteration rewrites the
//! inputs with the ranks computed by the previous one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::{store, Config, Job, KeyValue, Master, Worker};

/// Damping factor.
pub const D: f64 = 0.85;
/// Number of pages assumed by the damping term.
pub const N: f64 = 20000.0;

pub const JOB: &str = "pagerank";

/// Splits `page: rank, out1, out2` into its parts. A page without outbound
/// links is written `page: rank`.
pub fn parse_line(line: &str) -> Option<(&str, &str, Vec<&str>)> {
    let (page, rest) = line.split_once(": ")?;
    let (rank, links) = match rest.split_once(", ") {
        Some((rank, links)) => (rank, links.split(", ").map(str::trim).collect()),
        None => (rest, Vec::new()),
    };
    Some((page.trim(), rank.trim(), links))
}

fn format_rank(rank: f64) -> String {
    format!("{}", rank)
}

/// Emits each outbound link's share of the page's rank, plus the damping term
/// for the page itself.
///
/// Panics on a line that does not parse, which fails the task.
pub fn map(_filename: &str, contents: &str) -> Vec<KeyValue> {
    let mut res = Vec::new();
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let (page, rank, links) =
            parse_line(line).unwrap_or_else(|| panic!("malformed line {:?}", line));
        let rank: f64 = rank
            .parse()
            .unwrap_or_else(|e| panic!("bad rank {:?} for page {:?}: {}", rank, page, e));
        for link in links.iter() {
            res.push(KeyValue::new(*link, format_rank(rank / links.len() as f64)));
        }
        res.push(KeyValue::new(page, format_rank((1.0 - D) / (N * D))));
    }
    res
}

/// The new rank: `D` times the sum of incoming shares. Panics on a value that
/// is not a number.
pub fn reduce(key: &str, values: &[String]) -> String {
    let sum: f64 = values
        .iter()
        .map(|v| {
            v.parse::<f64>()
                .unwrap_or_else(|e| panic!("bad value {:?} for page {:?}: {}", v, key, e))
        })
        .sum();
    format_rank(D * sum)
}

/// Outbound links of every page, as written in the inputs.
pub fn process_links(inputs: &[PathBuf]) -> Result<HashMap<String, String>> {
    let mut links = HashMap::new();
    for input in inputs {
        let content =
            fs::read_to_string(input).with_context(|| format!("cannot read {:?}", input))?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let (page, _, outs) =
                parse_line(line).with_context(|| format!("malformed line {:?} in {:?}", line, input))?;
            links.insert(page.to_owned(), outs.join(", "));
        }
    }
    Ok(links)
}

/// Copies the inputs into `<dir>/tmp/`, where iterations may rewrite them.
pub fn copy_inputs(inputs: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
    let tmp = dir.join("tmp");
    fs::create_dir_all(&tmp).with_context(|| format!("cannot create {:?}", tmp))?;
    inputs
        .iter()
        .map(|input| {
            let name = input
                .file_name()
                .with_context(|| format!("{:?} is not a file", input))?;
            let copy = tmp.join(name);
            fs::copy(input, &copy).with_context(|| format!("cannot copy {:?}", input))?;
            Ok(copy)
        })
        .collect()
}

/// Rewrites every input line with the rank found in the merged output.
pub fn update_inputs(
    inputs: &[PathBuf],
    merged: &Path,
    links: &HashMap<String, String>,
) -> Result<()> {
    let ranks = store::read_merged(merged)?;
    for input in inputs {
        let content =
            fs::read_to_string(input).with_context(|| format!("cannot read {:?}", input))?;
        let mut out = String::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let (page, old_rank, _) =
                parse_line(line).with_context(|| format!("malformed line {:?} in {:?}", line, input))?;
            let rank = ranks.get(page).map(String::as_str).unwrap_or(old_rank);
            match links.get(page).filter(|l| !l.is_empty()) {
                Some(l) => out.push_str(&format!("{}: {}, {}\n", page, rank, l)),
                None => out.push_str(&format!("{}: {}\n", page, rank)),
            }
        }
        fs::write(input, out).with_context(|| format!("cannot write {:?}", input))?;
    }
    Ok(())
}

/// Empties the partition files of an iteration before the next one appends.
pub fn clean_up(dir: &Path, n_map: usize, n_reduce: usize) -> Result<()> {
    store::truncate_partitions(dir, JOB, n_map, n_reduce)
}

/// Runs `iterations` PageRank jobs over copies of `inputs`, with one
/// in-process worker per input file, and returns the final ranks.
pub async fn run(
    inputs: &[PathBuf],
    n_reduce: usize,
    iterations: usize,
    config: &Config,
) -> Result<BTreeMap<String, String>> {
    let links = process_links(inputs)?;
    let inputs = copy_inputs(inputs, &config.data_dir)?;
    let n_map = inputs.len();

    let mut ranks = BTreeMap::new();
    for i in 0..iterations {
        info!("pagerank iteration {}/{}", i + 1, iterations);
        let master = Master::new(Job::new(JOB, inputs.clone(), n_reduce), config.clone())?;
        master.start().await?;

        let workers: Vec<Worker> = (0..n_map.max(1))
            .map(|_| Worker::new(JOB, map, reduce, config.clone()))
            .collect();
        let handles: Vec<_> = workers
            .iter()
            .cloned()
            .map(|w| tokio::spawn(async move { w.start().await }))
            .collect();

        master.wait().await?;
        let merged = master.merge()?;
        update_inputs(&inputs, &merged, &links)?;
        ranks = store::read_merged(&merged)?;

        master.shutdown_workers().await;
        for w in workers.iter() {
            w.shutdown();
        }
        for handle in handles {
            match handle.await {
                Ok(Err(e)) => warn!("worker failed: {:#}", e),
                Err(e) => warn!("worker task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        clean_up(&config.data_dir, n_map, n_reduce)?;
    }

    let tmp = config.data_dir.join("tmp");
    fs::remove_dir_all(&tmp).with_context(|| format!("cannot remove {:?}", tmp))?;
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("A: 1.0, B, C"),
            Some(("A", "1.0", vec!["B", "C"]))
        );
        assert_eq!(parse_line("B: 0.5"), Some(("B", "0.5", vec![])));
        assert_eq!(parse_line("garbage"), None);
    }

    #[test]
    fn test_map_emits_shares_and_damping() {
        let kvs = map("f", "A: 1.0, B, C\n\nB: 0.5, A\n");
        let damping = format_rank((1.0 - D) / (N * D));
        assert_eq!(
            kvs,
            vec![
                KeyValue::new("B", "0.5"),
                KeyValue::new("C", "0.5"),
                KeyValue::new("A", damping.clone()),
                KeyValue::new("A", "0.5"),
                KeyValue::new("B", damping),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "bad rank")]
    fn test_map_rejects_bad_rank() {
        map("f", "C: 1, D\nA: notanumber, B");
    }

    #[test]
    #[should_panic(expected = "malformed line")]
    fn test_map_rejects_malformed_line() {
        map("f", "nonsense");
    }

    #[test]
    fn test_reduce_sums_and_damps() {
        assert_eq!(reduce("A", &["1".into(), "1".into()]), format_rank(D * 2.0));
        assert_eq!(format_rank(1.0), "1");
        assert_eq!(format_rank(0.5), "0.5");
    }

    #[test]
    #[should_panic(expected = "bad value")]
    fn test_reduce_rejects_bad_value() {
        reduce("A", &["0.5".into(), "garbage".into()]);
    }

    #[test]
    fn test_update_inputs() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("g.txt");
        fs::write(&input, "A: 1.0, B, C\nD: 1.0\n").unwrap();
        let inputs = vec![input.clone()];
        let links = process_links(&inputs).unwrap();
        assert_eq!(links["A"], "B, C");
        assert_eq!(links["D"], "");

        let merged = dir.path().join("merged");
        fs::write(&merged, "A: 0.25\nB: 0.75\n").unwrap();
        update_inputs(&inputs, &merged, &links).unwrap();
        assert_eq!(
            fs::read_to_string(&input).unwrap(),
            "A: 0.25, B, C\nD: 1.0\n"
        );
    }

    #[test]
    fn test_copy_inputs() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("g.txt");
        fs::write(&input, "A: 1.0, B").unwrap();
        let out = dir.path().join("out");
        let copies = copy_inputs(&[input], &out).unwrap();
        assert_eq!(copies, vec![out.join("tmp").join("g.txt")]);
        assert_eq!(fs::read_to_string(&copies[0]).unwrap(), "A: 1.0, B");
    }
}
