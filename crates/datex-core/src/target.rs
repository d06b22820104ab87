//! Endpoint addresses and targets
//!
//! A Target is the atomic unit of the filter algebra: a named endpoint
//! (optionally narrowed to one instance) or a pointer id whose
//! subscribers are addressed.

use std::fmt;

use crate::{DatexError, DatexResult, EndpointId, PointerId};

/// Endpoint namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKind {
    /// `@name`
    Person,
    /// `@+name`
    Institution,
    /// `@*name`
    Bot,
    /// `@@hex` - fixed-id endpoint
    Id,
}

impl EndpointKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EndpointKind::Person => "@",
            EndpointKind::Institution => "@+",
            EndpointKind::Bot => "@*",
            EndpointKind::Id => "@@",
        }
    }
}

/// Instance selector of an endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Instance {
    /// Any instance of the endpoint
    #[default]
    Any,
    /// Explicitly no instance (the endpoint itself)
    Empty,
    Named(String),
}

/// A named endpoint address
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub name: String,
    pub subspaces: Vec<String>,
    pub instance: Instance,
    /// Application space the endpoint acts in
    pub appspace: Option<Box<Endpoint>>,
}

impl Endpoint {
    pub fn new(kind: EndpointKind, name: impl Into<String>) -> Self {
        Endpoint {
            kind,
            name: name.into(),
            subspaces: Vec::new(),
            instance: Instance::Any,
            appspace: None,
        }
    }

    pub fn person(name: impl Into<String>) -> Self {
        Endpoint::new(EndpointKind::Person, name)
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Instance::Named(instance.into());
        self
    }

    pub fn with_subspace(mut self, subspace: impl Into<String>) -> Self {
        self.subspaces.push(subspace.into());
        self
    }

    pub fn with_appspace(mut self, appspace: Endpoint) -> Self {
        self.appspace = Some(Box::new(appspace));
        self
    }

    /// Parse `@name`, `@+org:sub/instance`, `@*bot`, `@@hex`
    pub fn parse(text: &str) -> DatexResult<Self> {
        let (kind, rest) = if let Some(r) = text.strip_prefix("@@") {
            (EndpointKind::Id, r)
        } else if let Some(r) = text.strip_prefix("@+") {
            (EndpointKind::Institution, r)
        } else if let Some(r) = text.strip_prefix("@*") {
            (EndpointKind::Bot, r)
        } else if let Some(r) = text.strip_prefix('@') {
            (EndpointKind::Person, r)
        } else {
            return Err(DatexError::Value(format!("invalid endpoint: {}", text)));
        };

        let (path, instance) = match rest.split_once('/') {
            Some((path, "")) => (path, Instance::Empty),
            Some((path, "*")) => (path, Instance::Any),
            Some((path, inst)) => (path, Instance::Named(inst.to_string())),
            None => (rest, Instance::Any),
        };

        let mut parts = path.split(':');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(DatexError::Value(format!("invalid endpoint: {}", text)));
        }

        Ok(Endpoint {
            kind,
            name: name.to_string(),
            subspaces: parts.map(str::to_string).collect(),
            instance,
            appspace: None,
        })
    }

    /// Canonical name without instance, used for the endpoint fingerprint
    pub fn canonical_name(&self) -> String {
        let mut s = format!("{}{}", self.kind.prefix(), self.name);
        for sub in &self.subspaces {
            s.push(':');
            s.push_str(sub);
        }
        s
    }

    pub fn id(&self) -> EndpointId {
        EndpointId::from_name(&self.canonical_name())
    }

    /// The same endpoint without instance qualification
    pub fn main(&self) -> Endpoint {
        Endpoint {
            instance: Instance::Any,
            ..self.clone()
        }
    }

    /// Whether `candidate` is addressed by this endpoint
    pub fn matches(&self, candidate: &Endpoint) -> bool {
        if self.kind != candidate.kind || self.name != candidate.name {
            return false;
        }
        if candidate.subspaces.len() < self.subspaces.len()
            || candidate.subspaces[..self.subspaces.len()] != self.subspaces[..]
        {
            return false;
        }
        match &self.instance {
            Instance::Any => true,
            other => *other == candidate.instance,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_name())?;
        match &self.instance {
            Instance::Any => Ok(()),
            Instance::Empty => f.write_str("/"),
            Instance::Named(i) => write!(f, "/{}", i),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self)
    }
}

/// Atomic address of the filter algebra
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Endpoint(Endpoint),
    /// The subscribers of a pointer
    Pointer(PointerId),
}

impl Target {
    pub fn parse(text: &str) -> DatexResult<Self> {
        if text.starts_with('$') {
            return Ok(Target::Pointer(PointerId::from_hex(text)?));
        }
        Ok(Target::Endpoint(Endpoint::parse(text)?))
    }

    pub fn as_endpoint(&self) -> Option<&Endpoint> {
        match self {
            Target::Endpoint(e) => Some(e),
            Target::Pointer(_) => None,
        }
    }

    pub fn matches(&self, candidate: &Target) -> bool {
        match (self, candidate) {
            (Target::Endpoint(a), Target::Endpoint(b)) => a.matches(b),
            (Target::Pointer(a), Target::Pointer(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Endpoint> for Target {
    fn from(e: Endpoint) -> Self {
        Target::Endpoint(e)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Endpoint(e) => write!(f, "{}", e),
            Target::Pointer(p) => write!(f, "{}", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for text in ["@alice", "@+unyt:dev/main", "@*bot/", "@@a1b2"] {
            let e = Endpoint::parse(text).unwrap();
            assert_eq!(e.to_string(), text);
        }
        let e = Endpoint::parse("@+unyt:dev/main").unwrap();
        assert_eq!(e.kind, EndpointKind::Institution);
        assert_eq!(e.subspaces, vec!["dev".to_string()]);
        assert_eq!(e.instance, Instance::Named("main".into()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Endpoint::parse("alice").is_err());
        assert!(Endpoint::parse("@").is_err());
    }

    #[test]
    fn test_unqualified_matches_instances() {
        let main = Endpoint::person("alice");
        let phone = Endpoint::person("alice").with_instance("phone");

        assert!(main.matches(&phone));
        assert!(main.matches(&main));
        assert!(!phone.matches(&main));
        assert!(!main.matches(&Endpoint::person("bob")));
    }

    #[test]
    fn test_subspace_prefix_matching() {
        let org = Endpoint::new(EndpointKind::Institution, "unyt");
        let dev = org.clone().with_subspace("dev");
        assert!(org.matches(&dev));
        assert!(!dev.matches(&org));
    }

    #[test]
    fn test_fingerprint_ignores_instance() {
        let a = Endpoint::person("alice");
        let b = Endpoint::person("alice").with_instance("x");
        assert_eq!(a.id(), b.id());
    }
}
