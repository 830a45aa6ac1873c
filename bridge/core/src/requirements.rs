//! Requirements checking
//!
//! Parses `requirements.txt`-style lines (`name [op version]`) and decides
//! which requirements an installed package inventory does not satisfy.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Version comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    /// `==`
    Eq,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `~=`: at least this version, within the same release series
    Compatible,
}

impl Comparator {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Compatible => "~=",
        }
    }
}

/// One parsed requirement line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    /// Distribution name as written
    pub name: String,
    /// Version constraint, if any
    pub constraint: Option<(Comparator, String)>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some((op, version)) => write!(f, "{}{}{}", self.name, op.symbol(), version),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for Requirement {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(op_start) = line.find(['=', '<', '>', '~']) else {
            return Ok(Self {
                name: valid_name(line)?,
                constraint: None,
            });
        };

        let name = valid_name(&line[..op_start])?;
        let rest = &line[op_start..];
        let (op, version) = if let Some(v) = rest.strip_prefix("==") {
            (Comparator::Eq, v)
        } else if let Some(v) = rest.strip_prefix(">=") {
            (Comparator::Ge, v)
        } else if let Some(v) = rest.strip_prefix("<=") {
            (Comparator::Le, v)
        } else if let Some(v) = rest.strip_prefix("~=") {
            (Comparator::Compatible, v)
        } else if let Some(v) = rest.strip_prefix('>') {
            (Comparator::Gt, v)
        } else if let Some(v) = rest.strip_prefix('<') {
            (Comparator::Lt, v)
        } else {
            return Err(format!("unsupported operator in {line:?}"));
        };

        let version = version.trim();
        if version.is_empty() || version.contains(['=', '<', '>', '~', ' ', ',']) {
            return Err(format!("unsupported version constraint in {line:?}"));
        }
        Ok(Self {
            name,
            constraint: Some((op, version.to_string())),
        })
    }
}

fn valid_name(raw: &str) -> Result<String, String> {
    let name = raw.trim();
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '[' | ']' | ','));
    if ok {
        Ok(name.to_string())
    } else {
        Err(format!("invalid package name {name:?}"))
    }
}

/// Parse requirement lines, skipping blanks, comments and pip options
///
/// Malformed lines are logged and skipped.
pub fn parse_requirements(content: &str) -> Vec<Requirement> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() || line.starts_with('-') {
                return None;
            }
            match line.parse::<Requirement>() {
                Ok(req) => Some(req),
                Err(reason) => {
                    tracing::warn!(line = index + 1, content = raw, %reason, "Skipping malformed requirement");
                    None
                }
            }
        })
        .collect()
}

/// Read and parse a requirements file
pub fn read_requirements(path: &Path) -> std::io::Result<Vec<Requirement>> {
    Ok(parse_requirements(&std::fs::read_to_string(path)?))
}

/// Package names are compared case-insensitively with `-`, `_` and `.`
/// treated as equal; extras in brackets are ignored.
pub fn normalize_name(name: &str) -> String {
    let base = name.split('[').next().unwrap_or(name);
    base.trim()
        .chars()
        .map(|c| match c {
            '_' | '.' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Numeric release segments, or `None` if any segment has no leading digits
fn release_segments(version: &str) -> Option<Vec<u64>> {
    let version = version.trim().trim_start_matches(['v', 'V']);
    version
        .split('.')
        .map(|segment| {
            let digits: String = segment.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

fn compare_segments(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0)))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

impl Requirement {
    /// Whether `installed` satisfies this requirement
    ///
    /// Returns `None` when either version cannot be compared.
    pub fn satisfied_by(&self, installed: &str) -> Option<bool> {
        let Some((op, required)) = &self.constraint else {
            return Some(true);
        };
        let have = release_segments(installed)?;
        let want = release_segments(required)?;
        let ord = compare_segments(&have, &want);
        Some(match op {
            Comparator::Eq => ord.is_eq(),
            Comparator::Ge => ord.is_ge(),
            Comparator::Le => ord.is_le(),
            Comparator::Gt => ord.is_gt(),
            Comparator::Lt => ord.is_lt(),
            Comparator::Compatible => {
                let prefix = want.len().saturating_sub(1).max(1);
                ord.is_ge()
                    && compare_segments(
                        &have[..prefix.min(have.len())],
                        &want[..prefix.min(want.len())],
                    )
                    .is_eq()
            }
        })
    }
}

/// Installed package versions keyed by normalized name
#[derive(Clone, Debug, Default)]
pub struct PackageInventory {
    versions: HashMap<String, String>,
}

impl PackageInventory {
    /// Empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `version` for `name`
    pub fn insert(&mut self, name: &str, version: impl Into<String>) {
        self.versions.insert(normalize_name(name), version.into());
    }

    /// Installed version of `name`, matched after name normalization
    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.versions.get(&normalize_name(name)).map(String::as_str)
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Build from the JSON printed by `pip list --format=json`
    pub fn from_pip_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(serde::Deserialize)]
        struct Entry {
            name: String,
            version: String,
        }
        let entries: Vec<Entry> = serde_json::from_slice(json)?;
        let mut inventory = Self::new();
        for entry in entries {
            inventory.insert(&entry.name, entry.version);
        }
        Ok(inventory)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for PackageInventory {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut inventory = Self::new();
        for (name, version) in iter {
            inventory.insert(name, version);
        }
        inventory
    }
}

/// Requirements the inventory does not satisfy
///
/// A version that cannot be compared counts as not installed, so the
/// installer gets a chance to fix it.
pub fn missing_requirements<'a>(
    requirements: &'a [Requirement],
    inventory: &PackageInventory,
) -> Vec<&'a Requirement> {
    requirements
        .iter()
        .filter(|req| match inventory.version_of(&req.name) {
            None => true,
            Some(installed) => match req.satisfied_by(installed) {
                Some(satisfied) => !satisfied,
                None => {
                    tracing::warn!(
                        requirement = %req,
                        installed,
                        "Cannot compare versions, treating requirement as not installed"
                    );
                    true
                }
            },
        })
        .collect()
}
