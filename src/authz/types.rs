use serde::{Deserialize, Serialize};

/// One key or a list of keys, all of which must be covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceKeys {
    One(String),
    Many(Vec<String>),
}

impl ResourceKeys {
    pub fn as_slice(&self) -> &[String] {
        match self {
            ResourceKeys::One(key) => std::slice::from_ref(key),
            ResourceKeys::Many(keys) => keys,
        }
    }
}

/// A permission the subject must hold. Without `resource_key` only a
/// type-wide grant satisfies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredPermission {
    pub resource_group: String,
    pub resource_type: String,
    pub permission: String,
    #[serde(default)]
    pub resource_key: Option<ResourceKeys>,
}

impl RequiredPermission {
    /// Parse `group.type:permission` with an optional `/key[,key...]`,
    /// e.g. `docs.document:view/7,8`.
    pub fn parse(s: &str) -> Option<Self> {
        let (target, keys) = match s.split_once('/') {
            Some((target, keys)) => (target, Some(keys)),
            None => (s, None),
        };
        let (resource, permission) = target.split_once(':')?;
        let (group, resource_type) = resource.split_once('.')?;
        if group.is_empty() || resource_type.is_empty() || permission.is_empty() {
            return None;
        }

        let resource_key = match keys {
            None => None,
            Some(keys) => {
                let keys: Vec<String> = keys
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect();
                match keys.len() {
                    0 => None,
                    1 => keys.into_iter().next().map(ResourceKeys::One),
                    _ => Some(ResourceKeys::Many(keys)),
                }
            }
        };

        Some(Self {
            resource_group: group.to_string(),
            resource_type: resource_type.to_string(),
            permission: permission.to_string(),
            resource_key,
        })
    }

    /// Required keys; empty means a type-wide grant is needed.
    pub fn keys(&self) -> &[String] {
        self.resource_key
            .as_ref()
            .map(ResourceKeys::as_slice)
            .unwrap_or(&[])
    }
}

impl std::fmt::Display for RequiredPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}:{}",
            self.resource_group, self.resource_type, self.permission
        )?;
        let keys = self.keys();
        if !keys.is_empty() {
            write!(f, "/{}", keys.join(","))?;
        }
        Ok(())
    }
}
