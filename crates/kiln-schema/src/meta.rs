use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Network configuration of the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Share the host network namespace.
    #[default]
    Host,
    /// Fresh network namespace with loopback only.
    None,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::None => f.write_str("none"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "none" => Ok(Self::None),
            other => Err(SchemaError::InvalidNetworkMode(other.to_owned())),
        }
    }
}

/// Immutable description of one step: what to run, with which environment,
/// where, and as whom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionMeta {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, interpreted relative to the sandbox root.
    #[serde(default)]
    pub cwd: String,
    /// `""`, `name`, `uid`, `name:group`, or `uid:gid`.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub network: NetworkMode,
}

impl ExecutionMeta {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    /// Check the invariants that can be verified without a root filesystem.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.args.is_empty() {
            return Err(SchemaError::EmptyArgs);
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(SchemaError::InvalidEnvName(key.clone()));
            }
        }
        self.user_spec()?;
        Ok(())
    }

    pub fn user_spec(&self) -> Result<UserSpec, SchemaError> {
        self.user.parse()
    }

    /// The working directory, with an empty value meaning the sandbox root.
    pub fn cwd_or_root(&self) -> &str {
        if self.cwd.is_empty() {
            "/"
        } else {
            &self.cwd
        }
    }

    /// Environment as `KEY=VALUE` strings, ordered by key.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// A user or group reference, by number or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdRef {
    Id(u32),
    Name(String),
}

impl IdRef {
    fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.contains(char::is_whitespace) || s.contains('/') {
            return None;
        }
        Some(match s.parse::<u32>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Name(s.to_owned()),
        })
    }
}

impl fmt::Display for IdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Parsed form of [`ExecutionMeta::user`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserSpec {
    pub user: IdRef,
    pub group: Option<IdRef>,
}

impl UserSpec {
    /// `0:0`, the identity used when no user is given.
    pub fn root() -> Self {
        Self {
            user: IdRef::Id(0),
            group: Some(IdRef::Id(0)),
        }
    }
}

impl FromStr for UserSpec {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let invalid = || SchemaError::InvalidUser(s.to_owned());
        let (user, group) = match s.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (s, None),
        };
        let user = IdRef::parse(user).ok_or_else(invalid)?;
        let group = match group {
            Some(g) if g.contains(':') => return Err(invalid()),
            Some(g) => Some(IdRef::parse(g).ok_or_else(invalid)?),
            None => None,
        };
        Ok(Self { user, group })
    }
}

impl fmt::Display for UserSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}:{group}", self.user),
            None => write!(f, "{}", self.user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_user_forms() {
        assert_eq!("".parse::<UserSpec>().unwrap(), UserSpec::root());
        assert_eq!(
            "1000".parse::<UserSpec>().unwrap(),
            UserSpec {
                user: IdRef::Id(1000),
                group: None
            }
        );
        assert_eq!(
            "builder:staff".parse::<UserSpec>().unwrap(),
            UserSpec {
                user: IdRef::Name("builder".to_owned()),
                group: Some(IdRef::Name("staff".to_owned())),
            }
        );
        assert_eq!(
            "builder:50".parse::<UserSpec>().unwrap(),
            UserSpec {
                user: IdRef::Name("builder".to_owned()),
                group: Some(IdRef::Id(50)),
            }
        );
    }

    #[test]
    fn parse_user_rejects_malformed() {
        for bad in [":", ":0", "0:", "a:b:c", "has space", "../etc"] {
            assert!(bad.parse::<UserSpec>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn user_spec_display_roundtrips() {
        for s in ["0:0", "1000", "nobody:nogroup"] {
            assert_eq!(s.parse::<UserSpec>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn validate_rejects_empty_args() {
        let meta = ExecutionMeta::default();
        assert!(matches!(meta.validate(), Err(SchemaError::EmptyArgs)));
    }

    #[test]
    fn validate_rejects_bad_env_names() {
        let meta = ExecutionMeta::new(["/bin/true"]).with_env("A=B", "c");
        assert!(matches!(
            meta.validate(),
            Err(SchemaError::InvalidEnvName(_))
        ));
        let meta = ExecutionMeta::new(["/bin/true"]).with_env("", "c");
        assert!(meta.validate().is_err());
    }

    #[test]
    fn env_list_is_sorted() {
        let meta = ExecutionMeta::new(["sh"])
            .with_env("ZED", "1")
            .with_env("ALPHA", "x=y");
        assert_eq!(meta.env_list(), vec!["ALPHA=x=y", "ZED=1"]);
    }

    #[test]
    fn empty_cwd_means_root() {
        assert_eq!(ExecutionMeta::new(["sh"]).cwd_or_root(), "/");
        assert_eq!(
            ExecutionMeta::new(["sh"]).with_cwd("/src").cwd_or_root(),
            "/src"
        );
    }

    #[test]
    fn network_mode_parse() {
        assert_eq!("host".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
        assert_eq!("none".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert!("bridge".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn meta_deserializes_with_defaults() {
        let meta: ExecutionMeta = serde_json::from_str(r#"{"args":["/bin/true"]}"#).unwrap();
        assert_eq!(meta.args, vec!["/bin/true"]);
        assert!(meta.env.is_empty());
        assert_eq!(meta.network, NetworkMode::Host);
    }
}
