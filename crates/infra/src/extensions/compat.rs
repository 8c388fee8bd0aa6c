//! Version compatibility ranges.
//!
//! Supported forms, comma-separated clauses all of which must hold:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `*` | any version |
//! | `1.2.3` / `=1.2.3` | exactly that version |
//! | `^1.2.3` | `>=1.2.3, <2.0.0` (`<0.3.0` when major is 0) |
//! | `~1.2.3` | `>=1.2.3, <1.3.0` |
//! | `>=`, `>`, `<`, `<=` | plain comparisons |
//!
//! Missing minor/patch components default to zero; pre-release and build
//! suffixes are ignored.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionError {
    pub input: String,
    pub reason: String,
}

impl VersionError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// `major.minor.patch`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        if core.is_empty() {
            return Err(VersionError::new(s, "empty version"));
        }

        let mut parts = [0u64; 3];
        let mut count = 0;
        for part in core.split('.') {
            if count == 3 {
                return Err(VersionError::new(s, "too many components"));
            }
            parts[count] = part
                .parse()
                .map_err(|_| VersionError::new(s, format!("'{part}' is not a number")))?;
            count += 1;
        }
        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq => v == &self.version,
            Op::Gt => v > &self.version,
            Op::Ge => v >= &self.version,
            Op::Lt => v < &self.version,
            Op::Le => v <= &self.version,
        }
    }
}

/// A parsed compatibility range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    raw: String,
    comparators: Vec<Comparator>,
}

impl VersionReq {
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            comparators: Vec::new(),
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for VersionReq {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(VersionError::new(s, "empty range"));
        }

        let mut comparators = Vec::new();
        for clause in s.split(',').map(str::trim) {
            if clause == "*" {
                continue;
            }
            let (op, rest) = split_op(clause);
            let version: Version = rest.trim().parse()?;
            match op {
                "^" => {
                    let upper = if version.major > 0 {
                        Version::new(version.major + 1, 0, 0)
                    } else {
                        Version::new(0, version.minor + 1, 0)
                    };
                    comparators.push(Comparator { op: Op::Ge, version });
                    comparators.push(Comparator { op: Op::Lt, version: upper });
                }
                "~" => {
                    comparators.push(Comparator { op: Op::Ge, version });
                    comparators.push(Comparator {
                        op: Op::Lt,
                        version: Version::new(version.major, version.minor + 1, 0),
                    });
                }
                "" | "=" => comparators.push(Comparator { op: Op::Eq, version }),
                ">=" => comparators.push(Comparator { op: Op::Ge, version }),
                ">" => comparators.push(Comparator { op: Op::Gt, version }),
                "<=" => comparators.push(Comparator { op: Op::Le, version }),
                "<" => comparators.push(Comparator { op: Op::Lt, version }),
                other => return Err(VersionError::new(s, format!("unknown operator '{other}'"))),
            }
        }

        Ok(Self {
            raw: s.trim().to_string(),
            comparators,
        })
    }
}

fn split_op(clause: &str) -> (&str, &str) {
    for op in [">=", "<=", ">", "<", "=", "^", "~"] {
        if let Some(rest) = clause.strip_prefix(op) {
            return (op, rest);
        }
    }
    ("", clause)
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
