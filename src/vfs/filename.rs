//! Names of files being opened, with their URI parameters.
//!
//! The engine hands `xOpen` a pointer into a buffer laid out as
//!
//! ```text
//! \0\0\0\0 database \0 key \0 value \0 ... \0 journal \0 wal \0
//! ```
//!
//! for main databases, journals and WALs. [`Filename::from_engine`] decodes
//! that layout; [`Filename::from_uri`] parses `file:` URIs on the host side.

use smallvec::SmallVec;
use std::fmt;

use crate::error::Error;
use crate::ffi;
use crate::vfs::{FileHandle, Result};

type Params = SmallVec<[(String, String); 4]>;

/// The name of a file being opened, with everything the engine knows about
/// it.
#[derive(Clone, Default)]
pub struct Filename {
    path: String,
    database: String,
    journal: String,
    wal: String,
    params: Params,
    database_file: Option<FileHandle>,
}

impl Filename {
    /// A database file, with the conventional journal and WAL names.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Filename {
            journal: format!("{path}-journal"),
            wal: format!("{path}-wal"),
            database: path.clone(),
            path,
            params: Params::new(),
            database_file: None,
        }
    }

    /// Parses a `file:` URI. Anything else is taken as a plain path.
    ///
    /// See [URI Filenames](https://www.sqlite.org/uri.html).
    pub fn from_uri(uri: &str) -> Result<Self> {
        let Some(rest) = uri.strip_prefix("file:") else {
            return Ok(Self::new(uri));
        };
        let rest = rest.split('#').next().unwrap_or_default();
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        let path = match path.strip_prefix("//") {
            Some(authority_path) => {
                let split = authority_path.find('/').unwrap_or(authority_path.len());
                let (authority, path) = authority_path.split_at(split);
                if !authority.is_empty() && authority != "localhost" {
                    return Err(Error::with_message(
                        ffi::SQLITE_ERROR,
                        format!("invalid uri authority: {authority}"),
                    ));
                }
                path
            }
            None => path,
        };

        let mut name = Self::new(percent_decode(path)?);
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                continue;
            }
            name.params
                .push((percent_decode(key)?, percent_decode(value)?));
        }
        Ok(name)
    }

    /// Decodes the engine's filename layout, given the pointer passed to
    /// `xOpen` as an offset into `memory`.
    pub fn from_engine(memory: &[u8], name: usize) -> Result<Self> {
        let mut pos = database_offset(memory, name);
        let mut next = || -> Result<&str> {
            let s = c_str(memory, pos)?;
            pos += s.len() + 1;
            Ok(s)
        };

        let database = next()?.to_owned();
        let mut params = Params::new();
        loop {
            let key = next()?;
            if key.is_empty() {
                break;
            }
            let value = next()?;
            params.push((key.to_owned(), value.to_owned()));
        }
        let journal = next()?.to_owned();
        let wal = next()?.to_owned();

        Ok(Filename {
            path: c_str(memory, name)?.to_owned(),
            database,
            journal,
            wal,
            params,
            database_file: None,
        })
    }

    /// Encodes the engine's filename layout. The database name starts at
    /// offset 4 of the result.
    pub fn to_engine(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4];
        let mut push = |s: &str| {
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        };
        push(&self.database);
        for (key, value) in &self.params {
            push(key);
            push(value);
        }
        push("");
        push(&self.journal);
        push(&self.wal);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf
    }

    /// The name of this file as `xOpen` received it.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The same name set, referring to the database's journal.
    pub fn for_journal(&self) -> Self {
        Filename {
            path: self.journal.clone(),
            ..self.clone()
        }
    }

    /// The same name set, referring to the database's WAL.
    pub fn for_wal(&self) -> Self {
        Filename {
            path: self.wal.clone(),
            ..self.clone()
        }
    }

    /// See [`sqlite3_filename_database`](https://sqlite.org/c3ref/filename_database.html).
    pub fn database(&self) -> &str {
        &self.database
    }

    /// See [`sqlite3_filename_journal`](https://sqlite.org/c3ref/filename_database.html).
    pub fn journal(&self) -> &str {
        &self.journal
    }

    /// See [`sqlite3_filename_wal`](https://sqlite.org/c3ref/filename_database.html).
    pub fn wal(&self) -> &str {
        &self.wal
    }

    /// The main database file, once open, for journals and WALs.
    ///
    /// See [`sqlite3_database_file_object`](https://sqlite.org/c3ref/database_file_object.html).
    pub fn database_file(&self) -> Option<&FileHandle> {
        self.database_file.as_ref()
    }

    pub fn set_database_file(&mut self, file: FileHandle) {
        self.database_file = Some(file);
    }

    /// All URI parameters, in order.
    pub fn uri_parameters(&self) -> &[(String, String)] {
        &self.params
    }

    /// See [`sqlite3_uri_parameter`](https://sqlite.org/c3ref/uri_boolean.html).
    pub fn uri_parameter(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// See [`sqlite3_uri_boolean`](https://sqlite.org/c3ref/uri_boolean.html).
    pub fn uri_boolean(&self, key: &str, default: bool) -> bool {
        self.uri_parameter(key)
            .and_then(parse_bool)
            .unwrap_or(default)
    }

    /// See [`sqlite3_uri_int64`](https://sqlite.org/c3ref/uri_boolean.html).
    pub fn uri_int64(&self, key: &str, default: i64) -> i64 {
        self.uri_parameter(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

impl fmt::Debug for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filename")
            .field("path", &self.path)
            .field("database", &self.database)
            .field("params", &self.params)
            .field("database_file", &self.database_file.is_some())
            .finish()
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Walks back from a journal or WAL name to the database name, which
/// follows four zero bytes.
pub fn database_offset(memory: &[u8], name: usize) -> usize {
    let mut pos = name.min(memory.len());
    while pos >= 4 && memory[pos - 4..pos] != [0, 0, 0, 0] {
        pos -= 1;
    }
    pos
}

fn c_str(memory: &[u8], pos: usize) -> Result<&str> {
    let tail = memory
        .get(pos..)
        .ok_or_else(|| Error::misuse("filename out of bounds"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::misuse("filename not terminated"))?;
    std::str::from_utf8(&tail[..len]).map_err(|_| Error::new(ffi::SQLITE_CANTOPEN))
}

/// Interprets a boolean the way the engine does: `on`, `yes`, `true` or a
/// nonzero number, and their opposites.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.as_bytes().first()? {
        b'0' => return Some(false),
        b'1'..=b'9' => return Some(true),
        _ => {}
    }
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).map_err(|_| Error::with_message(ffi::SQLITE_ERROR, "invalid uri encoding"))
}
