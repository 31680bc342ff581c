//! One safetensors file per role and saved step.
//!
//! A file holds the role's parameters under `model.*`, the optimizer moments
//! under `optim.*` and four scalars under `meta.*`. Files are written next to
//! their final name and renamed into place, so a visible file is complete.
//! An existing file is never replaced.

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs, io,
    path::{Path, PathBuf},
};

use tch::{nn::VarStore, Device, Kind, Tensor};
use thiserror::Error;
use tracing::{debug, info};

use crate::AdamW;

const EXTENSION: &str = "safetensors";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Generator,
    Discriminator,
}

impl Role {
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Generator => "G",
            Role::Discriminator => "D",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CheckpointMeta {
    pub step: u64,
    pub epoch: usize,
    pub optimizer_step: u64,
    pub learning_rate: f64,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no {role} checkpoint in {dir}")]
    NotFound { role: Role, dir: PathBuf },

    #[error("checkpoint {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CheckpointError {
    fn corrupt(path: &Path, reason: impl ToString) -> Self {
        Self::Corrupt {
            path: path.to_owned(),
            reason: reason.to_string(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, role: Role, step: u64) -> PathBuf {
        self.dir.join(format!("{}_{step}.{EXTENSION}", role.prefix()))
    }

    /// Saved steps for `role`, ascending. A missing directory has none.
    pub fn steps(&self, role: Role) -> Result<Vec<u64>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CheckpointError::io(&self.dir, err)),
        };
        let prefix = format!("{}_", role.prefix());
        let suffix = format!(".{EXTENSION}");
        let mut steps = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CheckpointError::io(&self.dir, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(step) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .and_then(|step| step.parse::<u64>().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn latest_step(&self, role: Role) -> Result<Option<u64>, CheckpointError> {
        Ok(self.steps(role)?.last().copied())
    }

    /// Writes `role`'s checkpoint for `step`. If one is already on disk it is
    /// kept as is and its path returned.
    pub fn save(
        &self,
        role: Role,
        vs: &VarStore,
        optimizer: &AdamW,
        learning_rate: f64,
        epoch: usize,
        step: u64,
    ) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|err| CheckpointError::io(&self.dir, err))?;
        let path = self.path_for(role, step);
        if path.exists() {
            debug!(role = %role, step, path = %path.display(), "Checkpoint already saved, keeping it");
            return Ok(path);
        }
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));

        let mut tensors: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .map(|(name, t)| (format!("model.{name}"), t.to_device(Device::Cpu)))
            .collect();
        tensors.extend(
            optimizer
                .state_tensors()
                .into_iter()
                .map(|(name, t)| (format!("optim.{name}"), t.to_device(Device::Cpu))),
        );
        tensors.push(("meta.step".into(), Tensor::from_slice(&[step as i64])));
        tensors.push(("meta.epoch".into(), Tensor::from_slice(&[epoch as i64])));
        tensors.push((
            "meta.optimizer_step".into(),
            Tensor::from_slice(&[optimizer.step_count() as i64]),
        ));
        tensors.push(("meta.learning_rate".into(), Tensor::from_slice(&[learning_rate])));

        Tensor::write_safetensors(&tensors, &tmp).map_err(|err| {
            CheckpointError::io(&tmp, io::Error::other(err.to_string()))
        })?;
        fs::rename(&tmp, &path).map_err(|err| CheckpointError::io(&path, err))?;
        info!(role = %role, step, epoch, path = %path.display(), "Saved checkpoint");
        Ok(path)
    }

    /// Restores `vs` and `optimizer` from the file saved at `step`.
    pub fn load(
        &self,
        role: Role,
        step: u64,
        vs: &VarStore,
        optimizer: &mut AdamW,
    ) -> Result<CheckpointMeta, CheckpointError> {
        let path = self.path_for(role, step);
        if !path.exists() {
            return Err(CheckpointError::NotFound {
                role,
                dir: self.dir.clone(),
            });
        }
        let tensors: HashMap<String, Tensor> = Tensor::read_safetensors(&path)
            .map_err(|err| CheckpointError::corrupt(&path, err))?
            .into_iter()
            .collect();

        let meta = CheckpointMeta {
            step: read_scalar(&tensors, "meta.step", &path)? as u64,
            epoch: read_scalar(&tensors, "meta.epoch", &path)? as usize,
            optimizer_step: read_scalar(&tensors, "meta.optimizer_step", &path)? as u64,
            learning_rate: tensors
                .get("meta.learning_rate")
                .map(|t| t.double_value(&[0]))
                .ok_or_else(|| CheckpointError::corrupt(&path, "missing meta.learning_rate"))?,
        };

        // nothing is copied until the whole file has been checked
        let mut pairs = Vec::new();
        for (name, var) in vs.variables() {
            let key = format!("model.{name}");
            let source = tensors
                .get(&key)
                .ok_or_else(|| CheckpointError::corrupt(&path, format!("missing {key}")))?;
            if source.size() != var.size() {
                return Err(CheckpointError::corrupt(
                    &path,
                    format!(
                        "{key} has shape {:?}, model expects {:?}",
                        source.size(),
                        var.size()
                    ),
                ));
            }
            pairs.push((var, source));
        }

        let optim: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(name, t)| {
                name.strip_prefix("optim.")
                    .map(|rest| (rest.to_owned(), t.shallow_clone()))
            })
            .collect();
        optimizer
            .restore_state(&optim, meta.optimizer_step)
            .map_err(|err| CheckpointError::corrupt(&path, err))?;
        optimizer.set_lr(meta.learning_rate);

        let _guard = tch::no_grad_guard();
        for (mut var, source) in pairs {
            var.copy_(&source.to_device(var.device()).to_kind(var.kind()));
        }

        debug!(role = %role, step = meta.step, epoch = meta.epoch, "Restored checkpoint");
        Ok(meta)
    }

    /// Restores the checkpoint with the largest step for `role`.
    pub fn load_latest(
        &self,
        role: Role,
        vs: &VarStore,
        optimizer: &mut AdamW,
    ) -> Result<CheckpointMeta, CheckpointError> {
        match self.latest_step(role)? {
            Some(step) => self.load(role, step, vs, optimizer),
            None => Err(CheckpointError::NotFound {
                role,
                dir: self.dir.clone(),
            }),
        }
    }
}

fn read_scalar(
    tensors: &HashMap<String, Tensor>,
    key: &str,
    path: &Path,
) -> Result<i64, CheckpointError> {
    let t = tensors
        .get(key)
        .ok_or_else(|| CheckpointError::corrupt(path, format!("missing {key}")))?;
    if t.numel() != 1 {
        return Err(CheckpointError::corrupt(path, format!("{key} is not a scalar")));
    }
    Ok(t.to_kind(Kind::Int64).int64_value(&[0]))
}
