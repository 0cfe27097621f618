// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::warn;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Names of result directories currently present. Taken immediately
/// before an execute step; diffed against a second snapshot afterwards.
/// Diffing scopes discovery to exactly what this step produced, unlike
/// a newest-mtime scan which races with other activity in the tree.
pub fn snapshot_results(dir: &Path) -> Result<BTreeSet<String>> {
    let mut set = BTreeSet::new();
    if !dir.exists() {
        return Ok(set);
    }
    for ent in dir.read_dir()? {
        let ent = ent?;
        if ent.file_type()?.is_dir() {
            set.insert(ent.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(set)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    None,
    One(String),
    Ambiguous {
        chosen: String,
        candidates: Vec<String>,
    },
}

impl Located {
    pub fn name(&self) -> Option<&str> {
        match self {
            Located::None => None,
            Located::One(name) => Some(name),
            Located::Ambiguous { chosen, .. } => Some(chosen),
        }
    }
}

pub fn locate(dir: &Path, before: &BTreeSet<String>) -> Result<Located> {
    let after = snapshot_results(dir)?;
    let mut new: Vec<String> = after.difference(before).cloned().collect();

    match new.len() {
        0 => {
            // The tool may have produced nothing or written elsewhere.
            // Not a step failure.
            warn!("locate: no new result under {:?}", dir);
            Ok(Located::None)
        }
        1 => Ok(Located::One(new.pop().unwrap())),
        _ => {
            warn!(
                "locate: {} new results under {:?}: {}",
                new.len(),
                dir,
                new.join(", ")
            );
            let stamped = new
                .iter()
                .map(|name| (name.clone(), dir_mtime(dir, name)))
                .collect::<Vec<_>>();
            let chosen = pick_newest(&stamped);
            warn!("locate: picking most recently modified {:?}", &chosen);
            Ok(Located::Ambiguous {
                chosen,
                candidates: new,
            })
        }
    }
}

fn dir_mtime(dir: &Path, name: &str) -> SystemTime {
    fs::metadata(dir.join(name))
        .and_then(|md| md.modified())
        .unwrap_or(UNIX_EPOCH)
}

fn pick_newest(candidates: &[(String, SystemTime)]) -> String {
    candidates
        .iter()
        .max_by_key(|(_, mtime)| *mtime)
        .map(|(name, _)| name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mkdirs(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir_all(root.join(name)).unwrap();
        }
    }

    #[test]
    fn test_single_new_result() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), &["a", "b"]);
        let before = snapshot_results(dir.path()).unwrap();

        mkdirs(dir.path(), &["c"]);
        assert_eq!(
            locate(dir.path(), &before).unwrap(),
            Located::One("c".into())
        );
    }

    #[test]
    fn test_no_new_result() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), &["a", "b"]);
        let before = snapshot_results(dir.path()).unwrap();

        assert_eq!(locate(dir.path(), &before).unwrap(), Located::None);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nonexistent");
        assert!(snapshot_results(&gone).unwrap().is_empty());
        assert_eq!(
            locate(&gone, &BTreeSet::new()).unwrap(),
            Located::None
        );
    }

    #[test]
    fn test_ambiguous_lists_all_candidates() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), &["a", "b"]);
        let before = snapshot_results(dir.path()).unwrap();

        mkdirs(dir.path(), &["c", "d"]);
        match locate(dir.path(), &before).unwrap() {
            Located::Ambiguous { chosen, candidates } => {
                assert_eq!(candidates, vec!["c".to_string(), "d".to_string()]);
                assert!(candidates.contains(&chosen));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pick_newest() {
        let base = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let cands = vec![
            ("old".to_string(), base),
            ("newest".to_string(), base + Duration::from_secs(30)),
            ("mid".to_string(), base + Duration::from_secs(10)),
        ];
        assert_eq!(pick_newest(&cands), "newest");
    }
}
