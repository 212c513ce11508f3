//! Token Data Loading
//!
//! Datasets are flat binary files of little-endian `u16` token ids, one per
//! split (`train.bin`, `val.bin`), with no header. Files can be far larger
//! than memory, so the loader never holds them: every [`DataLoader::get_batch`]
//! call opens the file, seeks to each random offset and reads exactly one
//! window of `block_size + 1` tokens.
//!
//! ## Batch Layout
//!
//! ```text
//! window: [t0, t1, t2, ..., t_block]
//! x row:  [t0, t1, ..., t_{block-1}]
//! y row:  [t1, t2, ..., t_block]          (y[i] == x[i + 1])
//! ```
//!
//! An optional `meta.json` next to the token files carries the vocabulary
//! size and, for character-level datasets, the id/character tables.

use crate::error::{GptError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bytes per stored token
const TOKEN_BYTES: u64 = 2;

/// Row-major `[batch, seq_len]` block of token ids
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenBatch {
    pub ids: Vec<usize>,
    pub batch: usize,
    pub seq_len: usize,
}

impl TokenBatch {
    pub fn new(ids: Vec<usize>, batch: usize, seq_len: usize) -> Result<Self> {
        if ids.len() != batch * seq_len {
            return Err(GptError::Validation(format!(
                "{} ids cannot form a [{}, {}] batch",
                ids.len(),
                batch,
                seq_len
            )));
        }
        Ok(Self {
            ids,
            batch,
            seq_len,
        })
    }

    /// Batch from equal-length rows
    pub fn from_rows(rows: &[Vec<usize>]) -> Result<Self> {
        let seq_len = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != seq_len) {
            return Err(GptError::Validation(
                "all rows in a batch must have the same length".to_string(),
            ));
        }
        Self::new(rows.concat(), rows.len(), seq_len)
    }

    /// Single-row batch
    pub fn single(ids: Vec<usize>) -> Self {
        let seq_len = ids.len();
        Self {
            ids,
            batch: 1,
            seq_len,
        }
    }

    pub fn row(&self, b: usize) -> &[usize] {
        &self.ids[b * self.seq_len..(b + 1) * self.seq_len]
    }

    pub fn get(&self, b: usize, i: usize) -> usize {
        self.ids[b * self.seq_len + i]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[usize]> {
        self.ids.chunks(self.seq_len.max(1)).take(self.batch)
    }
}

/// Dataset split
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Val];

    pub fn file_name(self) -> &'static str {
        match self {
            Split::Train => "train.bin",
            Split::Val => "val.bin",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
        }
    }
}

struct SplitFile {
    path: PathBuf,
    num_tokens: u64,
}

/// Random-access batch sampler over on-disk token files
pub struct DataLoader {
    train: SplitFile,
    val: SplitFile,
    pub batch_size: usize,
    pub block_size: usize,
}

impl DataLoader {
    /// Open `data_dir/train.bin` and `data_dir/val.bin`
    ///
    /// Only file sizes are read here.
    ///
    /// # Errors
    ///
    /// `Io` if either file is missing, `Validation` if either holds fewer
    /// than `block_size + 1` tokens.
    pub fn new(data_dir: impl AsRef<Path>, batch_size: usize, block_size: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let open = |split: Split| -> Result<SplitFile> {
            let path = data_dir.join(split.file_name());
            let bytes = std::fs::metadata(&path)?.len();
            let num_tokens = bytes / TOKEN_BYTES;
            if num_tokens < block_size as u64 + 1 {
                return Err(GptError::Validation(format!(
                    "{} holds {} tokens; need at least block_size + 1 = {}",
                    path.display(),
                    num_tokens,
                    block_size + 1
                )));
            }
            debug!(split = %split, tokens = num_tokens, "opened token file");
            Ok(SplitFile { path, num_tokens })
        };

        Ok(Self {
            train: open(Split::Train)?,
            val: open(Split::Val)?,
            batch_size,
            block_size,
        })
    }

    fn split_file(&self, split: Split) -> &SplitFile {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        }
    }

    pub fn num_tokens(&self, split: Split) -> u64 {
        self.split_file(split).num_tokens
    }

    /// Sample `batch_size` random windows from `split`
    ///
    /// Returns `(x, y)`, both `[batch_size, block_size]`, with `y` shifted
    /// one token ahead of `x`.
    pub fn get_batch<R: Rng + ?Sized>(
        &self,
        split: Split,
        rng: &mut R,
    ) -> Result<(TokenBatch, TokenBatch)> {
        let file = self.split_file(split);
        let block = self.block_size;
        let max_offset = file.num_tokens - block as u64 - 1;

        let mut x = Vec::with_capacity(self.batch_size * block);
        let mut y = Vec::with_capacity(self.batch_size * block);
        let mut buf = vec![0u8; (block + 1) * TOKEN_BYTES as usize];

        for _ in 0..self.batch_size {
            let offset = rng.random_range(0..=max_offset);
            let mut f = File::open(&file.path)?;
            f.seek(SeekFrom::Start(offset * TOKEN_BYTES))?;
            f.read_exact(&mut buf)?;

            let window: Vec<usize> = buf
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
                .collect();
            x.extend_from_slice(&window[..block]);
            y.extend_from_slice(&window[1..]);
        }

        Ok((
            TokenBatch::new(x, self.batch_size, block)?,
            TokenBatch::new(y, self.batch_size, block)?,
        ))
    }
}

/// Write tokens as a flat little-endian `u16` file
pub fn write_tokens(path: impl AsRef<Path>, tokens: &[u16]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for t in tokens {
        w.write_all(&t.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Dataset metadata stored as `meta.json`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub vocab_size: usize,
    /// Token id to string, present for character-level datasets
    #[serde(default)]
    pub itos: Option<BTreeMap<usize, String>>,
    #[serde(default)]
    pub stoi: Option<BTreeMap<String, usize>>,
}

impl DatasetMeta {
    pub const FILE_NAME: &'static str = "meta.json";

    /// Read `data_dir/meta.json`, or `None` if absent
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save(&self, data_dir: impl AsRef<Path>) -> Result<()> {
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Decode ids with the character table; unknown ids become `?`
    pub fn decode(&self, ids: &[usize]) -> Option<String> {
        let itos = self.itos.as_ref()?;
        Some(
            ids.iter()
                .map(|id| itos.get(id).map_or("?", String::as_str))
                .collect(),
        )
    }

    /// Encode text character by character; `None` if any character is unknown
    pub fn encode(&self, text: &str) -> Option<Vec<usize>> {
        let stoi = self.stoi.as_ref()?;
        text.chars()
            .map(|c| stoi.get(&c.to_string()).copied())
            .collect()
    }
}
