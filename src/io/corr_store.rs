//! Persisted correlation matrices.
//!
//! Named square matrices survive across processing runs in a plain text
//! file of repeated blocks:
//!
//! ```text
//! [NAME]
//! 1.0,0.2,0.1
//! 0.2,1.0,0.3
//! 0.1,0.3,1.0
//! [END NAME]
//! ```
//!
//! The store is an explicit dependency injected into the processor; tests
//! use an in-memory instance. Persistence is whole-file read and whole-file
//! rewrite, never partial.

use crate::types::{RadError, RadResult};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct CorrelationStore {
    matrices: BTreeMap<String, Array2<f64>>,
    path: Option<PathBuf>,
}

impl CorrelationStore {
    /// Volatile store with no file backing; `save` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed store. A missing file yields an empty store; an existing
    /// file must parse completely or the load fails.
    pub fn open(path: impl AsRef<Path>) -> RadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            matrices: BTreeMap::new(),
            path: Some(path.clone()),
        };
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            store.matrices = parse_blocks(&content)?;
            log::debug!(
                "correlation store loaded: {} matrices from {}",
                store.matrices.len(),
                path.display()
            );
        }
        Ok(store)
    }

    /// File-backed store that degrades gracefully: a corrupted file logs a
    /// warning and processing continues with correlation reset.
    pub fn open_or_reset(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::open(path) {
            Ok(store) => store,
            Err(e) => {
                log::warn!(
                    "could not read correlation store {}: {e}; continuing with empty store",
                    path.display()
                );
                Self {
                    matrices: BTreeMap::new(),
                    path: Some(path.to_path_buf()),
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f64>> {
        self.matrices.get(name)
    }

    pub fn insert(&mut self, name: &str, matrix: Array2<f64>) {
        self.matrices.insert(name.to_string(), matrix);
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    /// Rewrite the whole backing file from the in-memory state. One scoped
    /// critical section; concurrent runs must not interleave writes.
    pub fn save(&self) -> RadResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut out = String::new();
        for (name, matrix) in &self.matrices {
            out.push_str(&format!("[{name}]\n"));
            for row in matrix.rows() {
                let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                out.push_str(&line.join(","));
                out.push('\n');
            }
            out.push_str(&format!("[END {name}]\n"));
        }
        fs::write(path, out)?;
        log::debug!(
            "correlation store saved: {} matrices to {}",
            self.matrices.len(),
            path.display()
        );
        Ok(())
    }
}

fn parse_blocks(content: &str) -> RadResult<BTreeMap<String, Array2<f64>>> {
    let mut matrices = BTreeMap::new();
    let mut current: Option<(String, Vec<Vec<f64>>)> = None;

    for (lineno, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let header = &line[1..line.len() - 1];
            if let Some(name) = header.strip_prefix("END ") {
                let (open_name, rows) = current.take().ok_or_else(|| {
                    RadError::CorrelationStoreFormat(format!(
                        "line {}: end marker without open block", lineno + 1
                    ))
                })?;
                if open_name != name {
                    return Err(RadError::CorrelationStoreFormat(format!(
                        "line {}: block '{open_name}' closed by '[END {name}]'",
                        lineno + 1
                    )));
                }
                matrices.insert(open_name, rows_to_matrix(name, rows)?);
            } else {
                if current.is_some() {
                    return Err(RadError::CorrelationStoreFormat(format!(
                        "line {}: block '{header}' opened inside another block",
                        lineno + 1
                    )));
                }
                current = Some((header.to_string(), Vec::new()));
            }
        } else {
            let Some((_, rows)) = current.as_mut() else {
                return Err(RadError::CorrelationStoreFormat(format!(
                    "line {}: data outside a block", lineno + 1
                )));
            };
            let row: Result<Vec<f64>, _> = line
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse::<f64>())
                .collect();
            rows.push(row.map_err(|e| {
                RadError::CorrelationStoreFormat(format!("line {}: {e}", lineno + 1))
            })?);
        }
    }

    if let Some((name, _)) = current {
        return Err(RadError::CorrelationStoreFormat(format!(
            "block '{name}' is never closed"
        )));
    }
    Ok(matrices)
}

fn rows_to_matrix(name: &str, rows: Vec<Vec<f64>>) -> RadResult<Array2<f64>> {
    let n = rows.len();
    if n == 0 {
        return Err(RadError::CorrelationStoreFormat(format!(
            "block '{name}' is empty"
        )));
    }
    if rows.iter().any(|r| r.len() != n) {
        return Err(RadError::CorrelationStoreFormat(format!(
            "block '{name}' is not a square matrix"
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n, n), flat)
        .map_err(|e| RadError::CorrelationStoreFormat(format!("block '{name}': {e}")))
}
