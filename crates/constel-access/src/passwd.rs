use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswdError {
    #[error("user does not exist: {0}")]
    UserDoesNotExist(String),
    #[error("malformed passwd record on line {line}: expected 7 fields, found {fields}")]
    Malformed { line: usize, fields: usize },
    #[error("invalid {field} on line {line}: {value:?}")]
    InvalidId {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// One `/etc/passwd` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: PathBuf,
    pub shell: String,
}

/// Parsed `/etc/passwd` table keyed by username.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Passwd {
    entries: BTreeMap<String, PasswdEntry>,
}

impl Passwd {
    /// Parse colon-separated 7-field records. Blank lines and `#` comments are skipped.
    pub fn parse(content: &str) -> Result<Self, PasswdError> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() || raw.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = raw.split(':').collect();
            if fields.len() != 7 {
                return Err(PasswdError::Malformed {
                    line,
                    fields: fields.len(),
                });
            }
            let parse_id = |field: &'static str, value: &str| {
                value.parse::<u32>().map_err(|_| PasswdError::InvalidId {
                    line,
                    field,
                    value: value.to_string(),
                })
            };
            entries.insert(
                fields[0].to_string(),
                PasswdEntry {
                    uid: parse_id("uid", fields[2])?,
                    gid: parse_id("gid", fields[3])?,
                    gecos: fields[4].to_string(),
                    home: PathBuf::from(fields[5]),
                    shell: fields[6].to_string(),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn get(&self, username: &str) -> Result<&PasswdEntry, PasswdError> {
        self.entries
            .get(username)
            .ok_or_else(|| PasswdError::UserDoesNotExist(username.to_string()))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PasswdEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
