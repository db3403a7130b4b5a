//! Expansion of `__token__` placeholders in prompts.
//!
//! Each placeholder is replaced by a random line of the tag file whose name starts
//! with the token. Tokens nobody knows about are left in place, delimiters and all,
//! so the caller can still see what didn't resolve.

use lazy_static::lazy_static;
use rand::{seq::SliceRandom, Rng};
use regex::{Captures, Regex};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use crate::{GenError, Result};

lazy_static! {
    static ref WILDCARD: Regex = Regex::new(r"__([^_]+)__").unwrap();
}

/// Source of candidate lines for a wildcard token
pub trait TagLookup {
    fn lookup(&mut self, token: &str) -> Option<&[String]>;
}

impl TagLookup for HashMap<String, Vec<String>> {
    fn lookup(&mut self, token: &str) -> Option<&[String]> {
        self.get(token).map(Vec::as_slice)
    }
}

/// Tag files of one directory, read lazily and kept for as long as the cache lives.
/// Edits to a file after its first lookup are not picked up.
#[derive(Debug)]
pub struct WildcardCache {
    dir: PathBuf,
    tags: HashMap<String, Vec<String>>,
}

impl WildcardCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(GenError::WildcardDir(dir));
        }

        Ok(Self {
            dir,
            tags: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_cached(&self, token: &str) -> bool {
        self.tags.contains_key(token)
    }

    // first directory entry wins when several stems share the prefix
    fn load(&self, token: &str) -> io::Result<Option<Vec<String>>> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| stem.starts_with(token));

            if matches && path.is_file() {
                let contents = fs::read_to_string(&path)?;
                return Ok(Some(parse_lines(&contents)));
            }
        }

        Ok(None)
    }
}

impl TagLookup for WildcardCache {
    fn lookup(&mut self, token: &str) -> Option<&[String]> {
        if !self.tags.contains_key(token) {
            match self.load(token) {
                Ok(Some(lines)) => {
                    tracing::debug!(token, count = lines.len(), "loaded wildcard tags");
                    self.tags.insert(token.to_string(), lines);
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(%e, token, "could not read wildcard file");
                    return None;
                }
            }
        }

        self.tags.get(token).map(Vec::as_slice)
    }
}

fn parse_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Replaces every `__token__` in `prompt` using the thread-local RNG
pub fn resolve<L>(prompt: &str, lookup: &mut L) -> String
where
    L: TagLookup + ?Sized,
{
    resolve_with(prompt, lookup, &mut rand::thread_rng())
}

/// Replaces every `__token__` in `prompt` with a line picked by `rng`
pub fn resolve_with<L, R>(prompt: &str, lookup: &mut L, rng: &mut R) -> String
where
    L: TagLookup + ?Sized,
    R: Rng + ?Sized,
{
    if prompt.trim().is_empty() {
        return prompt.to_string();
    }

    WILDCARD
        .replace_all(prompt, |caps: &Captures| {
            match lookup.lookup(&caps[1]).and_then(|lines| lines.choose(&mut *rng)) {
                Some(line) => line.trim().to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
