//! Synthetic source paths of methods:
//!
//! ```text
//! /<dictionary>/<class>/<side>/<category>/<selector>[?env=<n>]
//! ```

use crate::debugger::error::Error;
use crate::gci::{Oop, DEFAULT_ENV};
use crate::query::QueryFacade;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum_macros::{Display as StrumDisplay, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Side {
    Instance,
    Class,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodLocation {
    pub dictionary: String,
    pub class: String,
    pub side: Side,
    pub category: String,
    pub selector: String,
    pub env: u16,
}

impl FromStr for MethodLocation {
    type Err = Error;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::SourceLocation(path.to_string(), reason);

        let rest = path.strip_prefix('/').ok_or(invalid("must start with `/`"))?;
        let (rest, env) = match rest.rsplit_once("?env=") {
            Some((rest, env)) => {
                let env = env.parse::<u16>().map_err(|_| invalid("bad environment id"))?;
                (rest, env)
            }
            None => (rest, DEFAULT_ENV),
        };

        // the selector is last and may itself contain `/`
        let parts: Vec<&str> = rest.splitn(5, '/').collect();
        let [dictionary, class, side, category, selector] = parts[..] else {
            return Err(invalid("expected five path segments"));
        };
        if [dictionary, class, selector].iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }
        let side =
            Side::from_str(side).map_err(|_| invalid("side must be `instance` or `class`"))?;

        Ok(Self {
            dictionary: dictionary.to_string(),
            class: class.to_string(),
            side,
            category: category.to_string(),
            selector: selector.to_string(),
            env,
        })
    }
}

impl Display for MethodLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}/{}",
            self.dictionary, self.class, self.side, self.category, self.selector
        )?;
        if self.env != DEFAULT_ENV {
            write!(f, "?env={}", self.env)?;
        }
        Ok(())
    }
}

impl MethodLocation {
    /// Class (or metaclass for the class side) named by this location.
    pub fn resolve_class(&self, query: &QueryFacade) -> Result<Oop, Error> {
        let dictionary = query.resolve_class(&self.dictionary)?;
        let name = query.new_symbol(&self.class)?;
        let class = query.perform(dictionary, "at:otherwise:", &[name, Oop::NIL])?;
        if class.is_nil() {
            return Err(Error::MethodNotFound(self.to_string()));
        }
        match self.side {
            Side::Instance => Ok(class),
            Side::Class => Ok(query.perform(class, "class", &[])?),
        }
    }

    /// Compiled method this location points to.
    pub fn resolve_method(&self, query: &QueryFacade) -> Result<Oop, Error> {
        let class = self.resolve_class(query)?;
        let method = query.compiled_method_at(class, &self.selector, self.env)?;
        if method.is_nil() {
            return Err(Error::MethodNotFound(self.to_string()));
        }
        Ok(method)
    }
}
