use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind};

/// The identity of a remote object: a name within an optional category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: &str, category: &str) -> Self {
        Identity {
            name: name.to_owned(),
            category: category.to_owned(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, name) = match s.find('/') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => ("", s),
        };
        if name.is_empty() || name.contains('/') {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid identity `{}'", s),
            ));
        }
        Ok(Identity::new(name, category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let id: Identity = "Arith".parse().unwrap();
        assert_eq!(id, Identity::new("Arith", ""));
        assert_eq!(id.to_string(), "Arith");

        let id: Identity = "math/Arith".parse().unwrap();
        assert_eq!(id.category, "math");
        assert_eq!(id.to_string(), "math/Arith");
    }

    #[test]
    fn reject_empty_name() {
        assert!("math/".parse::<Identity>().is_err());
        assert!("".parse::<Identity>().is_err());
        assert!("a/b/c".parse::<Identity>().is_err());
    }
}
