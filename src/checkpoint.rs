//! Parameter snapshots on disk.
//!
//! Each save writes `<dir>/model.ckpt-<epoch>` (bincode) and refreshes the
//! JSON index `<dir>/checkpoint` naming the newest file, so lookups do not
//! depend on directory listing order.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, UnetError},
    net::{Net, NetworkSpec},
    Float,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "model.ckpt";
const INDEX_FILENAME: &str = "checkpoint";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedParam {
    pub name: String,
    pub values: Vec<Float>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub epoch: usize,
    pub spec: NetworkSpec,
    pub params: Vec<NamedParam>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub model_checkpoint_path: String,
    pub all_model_checkpoint_paths: Vec<String>,
}

/// `<dir>/model.ckpt-<epoch>`
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{CHECKPOINT_PREFIX}-{epoch}"))
}

/// Epoch suffix of a checkpoint file name, if it is one.
fn epoch_of(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

impl Checkpoint {
    pub fn capture(net: &mut Net, epoch: usize) -> Self {
        let spec = *net.spec();
        let params = net
            .params_and_grads()
            .into_iter()
            .map(|p| NamedParam {
                name: p.name,
                values: p.params.to_vec(),
            })
            .collect();
        Self {
            version: CHECKPOINT_VERSION,
            epoch,
            spec,
            params,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        debug!("wrote {} parameters to {}", self.params.len(), path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|err| UnetError::checkpoint(path, format!("cannot open: {err}")))?;
        let checkpoint: Checkpoint = bincode::deserialize_from(BufReader::new(file))
            .map_err(|err| UnetError::checkpoint(path, format!("cannot decode: {err}")))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(UnetError::checkpoint(
                path,
                format!(
                    "unsupported version {} (expected {CHECKPOINT_VERSION})",
                    checkpoint.version
                ),
            ));
        }
        Ok(checkpoint)
    }

    /// Copies every parameter into `net` after checking that the checkpoint
    /// was written by a network of the same architecture.
    pub fn apply(&self, net: &mut Net, path: &Path) -> Result<()> {
        if self.spec != *net.spec() {
            return Err(UnetError::checkpoint(
                path,
                format!(
                    "written for {:?}, the network is {:?}",
                    self.spec,
                    net.spec()
                ),
            ));
        }

        let mut targets = net.params_and_grads();
        if targets.len() != self.params.len() {
            return Err(UnetError::checkpoint(
                path,
                format!(
                    "{} parameters stored, the network has {}",
                    self.params.len(),
                    targets.len()
                ),
            ));
        }

        // validate everything before touching the network
        for (stored, target) in self.params.iter().zip(targets.iter()) {
            if stored.name != target.name {
                return Err(UnetError::checkpoint(
                    path,
                    format!("expected parameter {}, found {}", target.name, stored.name),
                ));
            }
            if stored.values.len() != target.params.len() {
                return Err(UnetError::checkpoint(
                    path,
                    format!(
                        "parameter {} has {} values, expected {}",
                        stored.name,
                        stored.values.len(),
                        target.params.len()
                    ),
                ));
            }
        }

        for (stored, target) in self.params.iter().zip(targets.iter_mut()) {
            target.params.copy_from_slice(&stored.values);
            target.grads.fill(0.0);
        }
        Ok(())
    }
}

/// Writes the checkpoint for `epoch` and records it in the directory index.
pub fn save(net: &mut Net, dir: &Path, epoch: usize) -> Result<PathBuf> {
    let path = checkpoint_path(dir, epoch);
    Checkpoint::capture(net, epoch).write(&path)?;
    update_index(dir, &path)?;
    Ok(path)
}

pub fn restore(net: &mut Net, path: &Path) -> Result<usize> {
    let checkpoint = Checkpoint::read(path)?;
    checkpoint.apply(net, path)?;
    Ok(checkpoint.epoch)
}

fn read_index(dir: &Path) -> Result<Option<CheckpointIndex>> {
    let path = dir.join(INDEX_FILENAME);
    if !path.is_file() {
        return Ok(None);
    }
    let index = serde_json::from_reader(BufReader::new(File::open(&path)?))
        .map_err(|err| UnetError::checkpoint(&path, format!("malformed index: {err}")))?;
    Ok(Some(index))
}

fn update_index(dir: &Path, latest: &Path) -> Result<()> {
    let name = latest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| UnetError::checkpoint(latest, "not a file path"))?;

    let mut index = read_index(dir)?.unwrap_or_default();
    index.all_model_checkpoint_paths.retain(|p| *p != name);
    index.all_model_checkpoint_paths.push(name.clone());
    index.model_checkpoint_path = name;

    let writer = BufWriter::new(File::create(dir.join(INDEX_FILENAME))?);
    serde_json::to_writer_pretty(writer, &index)?;
    Ok(())
}

/// Newest checkpoint in `dir`: the one named by the index when it still
/// exists, otherwise the file with the highest epoch suffix.
pub fn latest(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    if let Some(index) = read_index(dir)? {
        let path = dir.join(&index.model_checkpoint_path);
        if path.is_file() {
            return Ok(Some(path));
        }
    }

    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(epoch) = epoch_of(&file_name.to_string_lossy()) else {
            continue;
        };
        if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
            best = Some((epoch, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}
