//! Function configuration shared by the gateway and function workers.
//!
//! The configuration is a JSON array of entries, e.g.
//! `[{"funcName": "Foo", "funcId": 1}, {"funcName": "Bar", "funcId": 2}]`.
use std::fs;
use std::io;
use std::path::Path;

use fnv::FnvHashMap as HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("Malformed function config: {0}.")]
    Json(#[from] serde_json::Error),
    #[error("Invalid func_id {0}, 0 is reserved")]
    InvalidFuncId(u16),
    #[error("Empty function name for func_id {0}")]
    EmptyFuncName(u16),
    #[error("Duplicate func_id {0}")]
    DuplicateFuncId(u16),
    #[error("Duplicate function name {0:?}")]
    DuplicateFuncName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuncEntry {
    pub func_name: String,
    pub func_id: u16,
}

#[derive(Debug, Clone, Default)]
pub struct FuncConfig {
    entries: Vec<FuncEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
    /// The raw JSON text, handed to launchers during their handshake.
    json: String,
}

impl FuncConfig {
    pub fn load(json: &str) -> Result<Self, Error> {
        let entries: Vec<FuncEntry> = serde_json::from_str(json)?;
        let mut by_name = HashMap::default();
        let mut by_id = HashMap::default();
        for (index, entry) in entries.iter().enumerate() {
            if entry.func_id == 0 {
                return Err(Error::InvalidFuncId(entry.func_id));
            }
            if entry.func_name.is_empty() {
                return Err(Error::EmptyFuncName(entry.func_id));
            }
            if by_id.insert(entry.func_id, index).is_some() {
                return Err(Error::DuplicateFuncId(entry.func_id));
            }
            if by_name.insert(entry.func_name.clone(), index).is_some() {
                return Err(Error::DuplicateFuncName(entry.func_name.clone()));
            }
        }
        Ok(FuncConfig {
            entries,
            by_name,
            by_id,
            json: json.to_owned(),
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Self::load(&content)
    }

    #[inline]
    pub fn find_by_func_name(&self, func_name: &str) -> Option<&FuncEntry> {
        self.by_name.get(func_name).map(|&i| &self.entries[i])
    }

    #[inline]
    pub fn find_by_func_id(&self, func_id: u16) -> Option<&FuncEntry> {
        self.by_id.get(&func_id).map(|&i| &self.entries[i])
    }

    #[inline]
    pub fn entries(&self) -> &[FuncEntry] {
        &self.entries
    }

    #[inline]
    pub fn json(&self) -> &str {
        &self.json
    }
}
