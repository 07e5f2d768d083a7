//! Object identities.

use std::fmt;
use std::str::FromStr;

use crate::error::{MarshalError, OrbError};
use crate::stream::{InputStream, OutputStream};

/// Identity of a remote object: a name qualified by an optional
/// category. Both parts are compared byte-for-byte; an empty name
/// denotes a null identity, which is never dispatchable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Identity {
            name: name.into(),
            category: category.into(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }

    pub(crate) fn write(&self, os: &mut OutputStream) {
        os.write_string(&self.name);
        os.write_string(&self.category);
    }

    pub(crate) fn read(is: &mut InputStream<'_>) -> Result<Self, MarshalError> {
        let name = is.read_string()?;
        let category = is.read_string()?;
        Ok(Identity { name, category })
    }
}

/// The string form is `category/name` with `/` and `\` backslash
/// escaped, or just `name` when the category is empty.
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.category.is_empty() {
            write_escaped(f, &self.category)?;
            f.write_str("/")?;
        }
        write_escaped(f, &self.name)
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    for c in s.chars() {
        if c == '/' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    Ok(())
}

impl FromStr for Identity {
    type Err = OrbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<String> = vec![String::new()];
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(e @ ('/' | '\\')) => parts.last_mut().expect("non-empty").push(e),
                    _ => return Err(OrbError::InvalidIdentity(s.to_string())),
                },
                '/' => parts.push(String::new()),
                c => parts.last_mut().expect("non-empty").push(c),
            }
        }
        let (category, name) = match parts.len() {
            1 => (String::new(), parts.pop().expect("one part")),
            2 => {
                let name = parts.pop().expect("two parts");
                (parts.pop().expect("two parts"), name)
            }
            _ => return Err(OrbError::InvalidIdentity(s.to_string())),
        };
        if name.is_empty() {
            return Err(OrbError::InvalidIdentity(s.to_string()));
        }
        Ok(Identity { name, category })
    }
}
