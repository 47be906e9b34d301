// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Environment setup files
//!
//! The workers expect a shared setup script (interpreter search paths and the like) to have been
//!   sourced before they start. Rather than mutating the launcher's own environment, the file is
//!   parsed into an [`Environment`] which is then handed to every spawn explicitly.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::ErrorKind;
use crate::Error;

/// Directory containing the running executable, with symlinks resolved
pub fn resolve_own_directory() -> Result<PathBuf, Error> {
    let exe = std::env::current_exe()?;
    let exe = exe.canonicalize()?;

    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::from("executable has no parent directory"))
}

/// Snapshot of the current process environment, used as the base for expansions
pub fn process_environment() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Variables set (and unset) by an environment setup file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
    unset: BTreeSet<String>,
}

impl Environment {
    /// Reads and parses the setup file at `path`
    ///
    /// `base` supplies the values for variables the file references but does not define itself.
    pub fn load(path: &Path, base: &HashMap<String, String>) -> Result<Self, Error> {
        let source = std::fs::read_to_string(path).map_err(|source| ErrorKind::EnvFile {
            path: path.to_path_buf(),
            source,
        })?;

        let env = Self::parse(&source, base)?;
        debug!(path = %path.display(), vars = env.vars.len(), unset = env.unset.len(), "loaded environment");
        Ok(env)
    }

    pub fn parse(source: &str, base: &HashMap<String, String>) -> Result<Self, Error> {
        let mut env = Self::default();

        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let stmt = raw.trim();
            if stmt.is_empty() || stmt.starts_with('#') {
                continue;
            }

            if let Some(names) = strip_keyword(stmt, "unset") {
                for name in names.split_whitespace() {
                    check_name(name, line)?;
                    env.remove(name);
                }
                continue;
            }

            let exported = strip_keyword(stmt, "export");
            let stmt = exported.unwrap_or(stmt);

            let (name, value) = match stmt.split_once('=') {
                Some(assignment) => assignment,
                // `export NAME` promotes an existing shell variable
                None if exported.is_some() => {
                    for name in stmt.split_whitespace() {
                        check_name(name, line)?;
                        if let Some(value) = env.lookup(name, base).map(str::to_string) {
                            env.set(name, value);
                        }
                    }
                    continue;
                }
                None => return Err(syntax(line, format!("unsupported statement: {}", stmt))),
            };

            check_name(name, line)?;
            let value = parse_value(value, line, |var| env.lookup(var, base))?;
            env.set(name, value);
        }

        Ok(env)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_unset(&self, name: &str) -> bool {
        self.unset.contains(name)
    }

    /// Assignments in the order they were first made
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn unset_vars(&self) -> impl Iterator<Item = &str> {
        self.unset.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.unset.is_empty()
    }

    pub fn set(&mut self, name: &str, value: String) {
        self.unset.remove(name);
        match self.vars.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.vars.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.vars.retain(|(k, _)| k != name);
        self.unset.insert(name.to_string());
    }

    /// Applies the variables to a command that is about to be spawned
    pub fn apply(&self, command: &mut Command) {
        for name in &self.unset {
            command.env_remove(name);
        }
        command.envs(self.vars());
    }

    /// Arguments for `env(1)` which reproduce this environment, e.g. `-u NAME KEY=VALUE`
    pub fn to_env_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.unset.len() * 2 + self.vars.len());
        for name in &self.unset {
            args.push("-u".to_string());
            args.push(name.clone());
        }
        args.extend(self.vars.iter().map(|(k, v)| format!("{}={}", k, v)));
        args
    }

    fn lookup<'a>(&'a self, name: &str, base: &'a HashMap<String, String>) -> Option<&'a str> {
        if self.unset.contains(name) {
            return None;
        }

        self.get(name).or_else(|| base.get(name).map(String::as_str))
    }
}

fn strip_keyword<'a>(stmt: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = stmt.strip_prefix(keyword)?;
    if rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn syntax(line: usize, msg: String) -> Error {
    Error::from(ErrorKind::EnvSyntax { line, msg })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn check_name(name: &str, line: usize) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => (first.is_ascii_alphabetic() || first == '_') && chars.all(is_name_char),
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(syntax(line, format!("invalid variable name: {:?}", name)))
    }
}

fn parse_value<'a, F>(src: &str, line: usize, lookup: F) -> Result<String, Error>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut value = String::new();
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => return Err(syntax(line, "unterminated single quote".to_string())),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c @ ('"' | '\\' | '$' | '`')) => value.push(c),
                        Some(c) => {
                            value.push('\\');
                            value.push(c);
                        }
                        None => return Err(syntax(line, "unterminated double quote".to_string())),
                    },
                    Some('$') => expand(&mut chars, &mut value, line, &lookup)?,
                    Some('`') => {
                        return Err(syntax(line, "command substitution is not supported".to_string()))
                    }
                    Some(c) => value.push(c),
                    None => return Err(syntax(line, "unterminated double quote".to_string())),
                }
            },
            '\\' => {
                if let Some(c) = chars.next() {
                    value.push(c);
                }
            }
            '$' => expand(&mut chars, &mut value, line, &lookup)?,
            '`' => return Err(syntax(line, "command substitution is not supported".to_string())),
            c if c.is_whitespace() => {
                let rest: String = chars.by_ref().collect();
                let rest = rest.trim_start();
                if rest.is_empty() || rest.starts_with('#') {
                    break;
                }
                return Err(syntax(line, format!("unexpected content after value: {}", rest)));
            }
            c => value.push(c),
        }
    }

    Ok(value)
}

/// Expands the variable reference following a `$`
fn expand<'a, I, F>(
    chars: &mut std::iter::Peekable<I>,
    value: &mut String,
    line: usize,
    lookup: &F,
) -> Result<(), Error>
where
    I: Iterator<Item = char>,
    F: Fn(&str) -> Option<&'a str>,
{
    match chars.peek() {
        Some('(') => Err(syntax(line, "command substitution is not supported".to_string())),
        Some('{') => {
            chars.next();
            let mut inner = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => inner.push(c),
                    None => return Err(syntax(line, "unterminated ${".to_string())),
                }
            }

            let (name, default) = match inner.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (inner.as_str(), None),
            };
            check_name(name, line)?;

            match lookup(name) {
                Some(v) if !v.is_empty() => value.push_str(v),
                _ => value.push_str(default.unwrap_or_default()),
            }
            Ok(())
        }
        Some(&c) if c.is_ascii_alphabetic() || c == '_' => {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if !is_name_char(c) {
                    break;
                }
                name.push(c);
                chars.next();
            }
            if let Some(v) = lookup(&name) {
                value.push_str(v);
            }
            Ok(())
        }
        _ => {
            value.push('$');
            Ok(())
        }
    }
}
