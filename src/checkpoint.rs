//! Checkpoint Files
//!
//! A checkpoint holds everything needed to rebuild the model and continue
//! counting iterations. Optimizer moments are not stored; a resumed run
//! starts AdamW from zero.
//!
//! ## Layout (all little-endian)
//!
//! ```text
//! u64         iter_num
//! f32         best_val_loss
//! u32         header length in bytes
//! [u8]        JSON header {model_args, config, tensors: [{name, shape}]}
//! [f32]...    tensor data, in header order
//! ```
//!
//! Saves go to `<path>.tmp` first and are renamed into place, so a crash
//! mid-write never leaves a truncated `ckpt.bin` behind.

use crate::config::{ModelConfig, TrainConfig};
use crate::error::{GptError, Result};
use crate::model::Gpt;
use crate::parameter::Module;
use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// File name inside `out_dir`
pub const CHECKPOINT_FILE: &str = "ckpt.bin";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TensorInfo {
    name: String,
    shape: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    model_args: ModelConfig,
    config: TrainConfig,
    tensors: Vec<TensorInfo>,
}

/// A loaded checkpoint
pub struct Checkpoint {
    pub model_args: ModelConfig,
    pub config: TrainConfig,
    pub iter_num: usize,
    pub best_val_loss: f32,
    pub state: BTreeMap<String, Tensor>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `model` and training state to `path`
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    model: &Gpt,
    config: &TrainConfig,
    iter_num: usize,
    best_val_loss: f32,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let params = model.parameters();
    let header = Header {
        model_args: model.config().clone(),
        config: config.clone(),
        tensors: params
            .iter()
            .map(|p| TensorInfo {
                name: p.name.clone(),
                shape: p.value.shape.clone(),
            })
            .collect(),
    };
    let header = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| GptError::Checkpoint("checkpoint header too large".to_string()))?;

    let tmp = tmp_path(path);
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(&(iter_num as u64).to_le_bytes())?;
        w.write_all(&best_val_loss.to_le_bytes())?;
        w.write_all(&header_len.to_le_bytes())?;
        w.write_all(&header)?;
        for p in &params {
            for v in &p.value.data {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        w.flush()?;
    }
    std::fs::rename(&tmp, path)?;

    info!(path = %path.display(), iter_num, best_val_loss, "saved checkpoint");
    Ok(())
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn truncated(e: std::io::Error) -> GptError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        GptError::Checkpoint("checkpoint file is truncated".to_string())
    } else {
        GptError::Io(e)
    }
}

/// `iter_num`, `best_val_loss` and the header length
const PREAMBLE_LEN: u64 = 8 + 4 + 4;

/// Reserve `len` bytes of the unread file, failing if fewer are left
fn take(remaining: &mut u64, len: usize, what: &str) -> Result<()> {
    let len = len as u64;
    if len > *remaining {
        return Err(GptError::Checkpoint(format!(
            "{} needs {} bytes but only {} remain; file is truncated or corrupt",
            what, len, remaining
        )));
    }
    *remaining -= len;
    Ok(())
}

impl Checkpoint {
    /// Read a checkpoint written by [`save_checkpoint`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // sizes read from the file are checked against this before allocating
        let mut remaining = file.metadata()?.len();
        let mut r = BufReader::new(file);

        let iter_num = u64::from_le_bytes(read_array(&mut r)?) as usize;
        let best_val_loss = f32::from_le_bytes(read_array(&mut r)?);
        let header_len = u32::from_le_bytes(read_array(&mut r)?) as usize;
        remaining = remaining.saturating_sub(PREAMBLE_LEN);

        take(&mut remaining, header_len, "header")?;
        let mut header = vec![0u8; header_len];
        r.read_exact(&mut header).map_err(truncated)?;
        let header: Header = serde_json::from_slice(&header)
            .map_err(|e| GptError::Checkpoint(format!("malformed header: {}", e)))?;

        let mut state = BTreeMap::new();
        for info in header.tensors {
            let byte_len = info
                .shape
                .iter()
                .try_fold(4usize, |acc, &d| acc.checked_mul(d))
                .ok_or_else(|| {
                    GptError::Checkpoint(format!(
                        "tensor '{}' shape {:?} overflows",
                        info.name, info.shape
                    ))
                })?;
            take(&mut remaining, byte_len, &info.name)?;
            let mut bytes = vec![0u8; byte_len];
            r.read_exact(&mut bytes).map_err(truncated)?;
            let data = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            state.insert(info.name, Tensor::new(data, info.shape));
        }

        let mut rest = [0u8; 1];
        if r.read(&mut rest)? != 0 {
            return Err(GptError::Checkpoint(
                "trailing bytes after tensor data".to_string(),
            ));
        }

        info!(path = %path.display(), iter_num, best_val_loss, "loaded checkpoint");
        Ok(Self {
            model_args: header.model_args,
            config: header.config,
            iter_num,
            best_val_loss,
            state,
        })
    }

    /// Construct a model with the stored architecture and weights
    pub fn into_model<R: Rng + ?Sized>(self, rng: &mut R) -> Result<Gpt> {
        let mut model = Gpt::new(self.model_args, rng)?;
        model.load_state_dict(self.state)?;
        Ok(model)
    }
}
